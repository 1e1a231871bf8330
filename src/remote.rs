//! Remote Command Interface
//!
//! The transport that submits requests to named services on named machines
//! lives outside the engine. The engine only needs the narrow contract in
//! [`RemoteCommandClient`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Service answering file-system queries such as the path separator.
pub const FS_SERVICE: &str = "FS";

/// Request sent to [`FS_SERVICE`] to look up a machine's file separator.
pub const FILE_SEPARATOR_REQUEST: &str = "RESOLVE STRING {Config/Sep/File}";

/// How a synchronous-style submission is delivered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Wait for the service's reply.
    Synchronous,
    /// Return immediately without a reply.
    FireAndForget,
    /// Queue the reply for later retrieval.
    Queued,
}

/// Return code and payload of a completed request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub code: i32,
    pub payload: String,
}

impl CommandResult {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            code: 0,
            payload: payload.into(),
        }
    }

    pub fn failed(code: i32, payload: impl Into<String>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Identifier assigned to an asynchronous submission.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Messaging handle registered on behalf of one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandHandle {
    pub id: u64,
    pub name: String,
}

/// Completion callback for [`RemoteCommandClient::submit_async`].
pub type CommandCallback = Box<dyn FnOnce(CommandResult) + Send + 'static>;

/// Client for the distributed command service.
///
/// `submit_async` must not invoke the callback on the calling thread
/// while it still holds engine locks; implementations either call it from
/// their own thread or after returning.
pub trait RemoteCommandClient: Send + Sync {
    /// Submits a request and, in [`SubmitMode::Synchronous`], waits for it.
    fn submit(
        &self,
        machine: &str,
        service: &str,
        request: &str,
        mode: SubmitMode,
    ) -> Result<CommandResult>;

    /// Submits a request and reports its completion through `callback`.
    fn submit_async(
        &self,
        machine: &str,
        service: &str,
        request: &str,
        callback: CommandCallback,
    ) -> Result<RequestId>;

    /// Registers a messaging handle for a job.
    fn register_handle(&self, name: &str) -> Result<CommandHandle>;

    /// Releases a handle obtained from [`register_handle`](Self::register_handle).
    fn release_handle(&self, handle: &CommandHandle) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process client used by the engine's tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::EngineError;

    /// Answers from a canned table, completing async requests on a
    /// separate OS thread.
    #[derive(Default)]
    pub struct MockClient {
        replies: Mutex<HashMap<(String, String), CommandResult>>,
        pub submitted: Mutex<Vec<(String, String, String)>>,
        pub released: Mutex<Vec<CommandHandle>>,
        next_id: AtomicU64,
        pub refuse: bool,
    }

    impl MockClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::default()
            }
        }

        pub fn reply(self, machine: &str, service: &str, result: CommandResult) -> Self {
            self.replies
                .lock()
                .insert((machine.to_string(), service.to_string()), result);
            self
        }

        fn answer(&self, machine: &str, service: &str, request: &str) -> CommandResult {
            self.submitted
                .lock()
                .push((machine.to_string(), service.to_string(), request.to_string()));
            self.replies
                .lock()
                .get(&(machine.to_string(), service.to_string()))
                .cloned()
                .unwrap_or_else(|| CommandResult::failed(16, "no such service"))
        }
    }

    impl RemoteCommandClient for MockClient {
        fn submit(
            &self,
            machine: &str,
            service: &str,
            request: &str,
            _mode: SubmitMode,
        ) -> Result<CommandResult> {
            Ok(self.answer(machine, service, request))
        }

        fn submit_async(
            &self,
            machine: &str,
            service: &str,
            request: &str,
            callback: CommandCallback,
        ) -> Result<RequestId> {
            if self.refuse {
                return Err(EngineError::RemoteCommand {
                    machine: machine.to_string(),
                    service: service.to_string(),
                    code: 21,
                    message: "not responding".to_string(),
                });
            }
            let result = self.answer(machine, service, request);
            thread::spawn(move || callback(result));
            Ok(RequestId(self.next_id.fetch_add(1, Ordering::Relaxed)))
        }

        fn register_handle(&self, name: &str) -> Result<CommandHandle> {
            Ok(CommandHandle {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
            })
        }

        fn release_handle(&self, handle: &CommandHandle) -> Result<()> {
            self.released.lock().push(handle.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockClient;
    use super::*;

    #[test]
    fn test_command_result_helpers() {
        assert!(CommandResult::ok("done").is_ok());
        assert!(!CommandResult::failed(7, "nope").is_ok());
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId(42).to_string(), "#42");
    }

    #[test]
    fn test_mock_sync_submit() {
        let client = MockClient::new().reply("lab1", FS_SERVICE, CommandResult::ok("/"));
        let result = client
            .submit("lab1", FS_SERVICE, FILE_SEPARATOR_REQUEST, SubmitMode::Synchronous)
            .unwrap();
        assert_eq!(result.payload, "/");

        let missing = client
            .submit("lab2", FS_SERVICE, FILE_SEPARATOR_REQUEST, SubmitMode::Synchronous)
            .unwrap();
        assert_eq!(missing.code, 16);
        assert_eq!(client.submitted.lock().len(), 2);
    }
}
