use tracing::debug;

use crate::error::Result;
use crate::proxy::chain::FlowHandler;
use crate::proxy::flow::Flow;

/// Leaves flows untouched; registered when no rewrite rules are configured
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughHandler;

impl FlowHandler for PassthroughHandler {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn on_request(&self, flow: &mut Flow) -> Result<()> {
        debug!(flow_id = %flow.id, method = %flow.method(), url = %flow.url(), "Passing request through");
        Ok(())
    }
}
