//! Ordered request/response interceptors
//!
//! Handlers run in registration order for both phases. A handler that
//! returns an error or panics is skipped: the flow is restored to the state
//! it had before that handler ran, the failure is logged, and the next
//! handler proceeds.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{InterposeError, Result};
use crate::proxy::flow::Flow;

/// Inspects and mutates a [`Flow`].
///
/// Handlers are synchronous and must not perform network I/O; the proxy
/// owns every socket.
pub trait FlowHandler: Send + Sync {
    fn name(&self) -> &str;

    fn on_request(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }

    fn on_response(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Request,
    Response,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
        }
    }
}

#[derive(Default)]
pub struct HandlerChain {
    handlers: RwLock<Vec<Arc<dyn FlowHandler>>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; it runs after every handler registered before it
    pub fn add_handler(&self, handler: Arc<dyn FlowHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers
            .read()
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Run every handler's request phase; returns the failures that were contained
    pub fn run_request_phase(&self, flow: &mut Flow) -> Vec<InterposeError> {
        self.run(Phase::Request, flow)
    }

    /// Run every handler's response phase; returns the failures that were contained
    pub fn run_response_phase(&self, flow: &mut Flow) -> Vec<InterposeError> {
        self.run(Phase::Response, flow)
    }

    fn run(&self, phase: Phase, flow: &mut Flow) -> Vec<InterposeError> {
        // Held across the iteration so registration cannot interleave with a pass.
        let handlers = self.handlers.read();
        let mut failures = Vec::new();

        for handler in handlers.iter() {
            let before = flow.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| match phase {
                Phase::Request => handler.on_request(flow),
                Phase::Response => handler.on_response(flow),
            }));

            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };

            *flow = before;
            warn!(
                flow_id = %flow.id,
                handler = handler.name(),
                phase = phase.as_str(),
                error = %message,
                "Handler failed; continuing without its changes"
            );
            failures.push(InterposeError::Handler {
                handler: handler.name().to_string(),
                message,
            });
        }

        failures
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::flow::Scheme;
    use http::{HeaderValue, Method};

    /// Appends its id to `x-order` in both phases
    struct Marker(&'static str);

    impl FlowHandler for Marker {
        fn name(&self) -> &str {
            self.0
        }

        fn on_request(&self, flow: &mut Flow) -> Result<()> {
            flow.headers
                .append("x-order", HeaderValue::from_static(self.0));
            Ok(())
        }

        fn on_response(&self, flow: &mut Flow) -> Result<()> {
            flow.tags.push(format!("resp:{}", self.0));
            Ok(())
        }
    }

    /// Mutates the flow, then fails
    struct Broken;

    impl FlowHandler for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn on_request(&self, flow: &mut Flow) -> Result<()> {
            flow.headers
                .insert("x-partial", HeaderValue::from_static("oops"));
            flow.path = "/hijacked".to_string();
            Err(InterposeError::InvalidRequest("rule failed".to_string()))
        }
    }

    struct Panicky;

    impl FlowHandler for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn on_request(&self, flow: &mut Flow) -> Result<()> {
            flow.host = "elsewhere".to_string();
            panic!("handler bug");
        }
    }

    fn flow() -> Flow {
        Flow::new(Method::GET, Scheme::Http, "example.com", 80, "/")
    }

    fn order(flow: &Flow) -> Vec<&str> {
        flow.headers
            .get_all("x-order")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect()
    }

    #[test]
    fn test_handlers_run_once_in_registration_order() {
        let chain = HandlerChain::new();
        for id in ["a", "b", "c", "d"] {
            chain.add_handler(Arc::new(Marker(id)));
        }

        let mut flow = flow();
        assert!(chain.run_request_phase(&mut flow).is_empty());
        assert_eq!(order(&flow), vec!["a", "b", "c", "d"]);

        assert!(chain.run_response_phase(&mut flow).is_empty());
        assert_eq!(flow.tags, vec!["resp:a", "resp:b", "resp:c", "resp:d"]);
    }

    #[test]
    fn test_failing_handler_is_rolled_back_and_skipped() {
        let chain = HandlerChain::new();
        chain.add_handler(Arc::new(Marker("first")));
        chain.add_handler(Arc::new(Broken));
        chain.add_handler(Arc::new(Marker("third")));

        let mut flow = flow();
        let failures = chain.run_request_phase(&mut flow);

        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            InterposeError::Handler { handler, .. } if handler == "broken"
        ));
        assert_eq!(order(&flow), vec!["first", "third"]);
        assert!(flow.headers.get("x-partial").is_none());
        assert_eq!(flow.path, "/");
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let chain = HandlerChain::new();
        chain.add_handler(Arc::new(Panicky));
        chain.add_handler(Arc::new(Marker("after")));

        let mut flow = flow();
        let failures = chain.run_request_phase(&mut flow);

        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("handler bug"));
        assert_eq!(flow.host, "example.com");
        assert_eq!(order(&flow), vec!["after"]);
    }

    #[test]
    fn test_default_phases_are_noops() {
        struct Quiet;
        impl FlowHandler for Quiet {
            fn name(&self) -> &str {
                "quiet"
            }
        }

        let chain = HandlerChain::new();
        assert!(chain.is_empty());
        chain.add_handler(Arc::new(Quiet));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.names(), vec!["quiet"]);

        let mut flow = flow();
        let before = flow.url();
        assert!(chain.run_request_phase(&mut flow).is_empty());
        assert!(chain.run_response_phase(&mut flow).is_empty());
        assert_eq!(flow.url(), before);
    }
}
