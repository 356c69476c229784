use std::collections::{HashMap, VecDeque};
use std::future::{ready, Future};
use std::sync::Mutex;

use tally_core::{Request, RequestError, Response, Transport};

use crate::scenario::Outcome;

/// Answers requests from a fixed per-command script.
pub struct ScriptedTransport {
    script: Mutex<HashMap<String, VecDeque<Outcome>>>,
}

impl ScriptedTransport {
    pub fn new(script: HashMap<String, Vec<Outcome>>) -> Self {
        let script = script
            .into_iter()
            .map(|(command, outcomes)| (command, outcomes.into()))
            .collect();
        Self {
            script: Mutex::new(script),
        }
    }

    fn next(&self, command: &str) -> Result<Response, RequestError> {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        script
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .map_or_else(|| Ok(Response::ok()), Into::into)
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &Request) -> impl Future<Output = Result<Response, RequestError>> + Send {
        ready(self.next(&request.command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_is_consumed_in_order_then_succeeds() {
        let transport = ScriptedTransport::new(HashMap::from([(
            "Ping".to_string(),
            vec![Outcome::Error(RequestError::network("down"))],
        )]));
        let request = Request::new("Ping");
        assert!(transport.send(&request).await.is_err());
        assert!(transport.send(&request).await.unwrap().is_ok());
        assert!(transport
            .send(&Request::new("Other"))
            .await
            .unwrap()
            .is_ok());
    }
}
