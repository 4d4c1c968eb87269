//! Pluggable protocol interception.
//!
//! An interceptor is a pair of per-direction transforms supplied by an
//! external collaborator and injected at session construction, keyed by the
//! relay purpose code. The engine never inspects interceptor internals; it
//! only guarantees call ordering (one call per non-empty chunk, in arrival
//! order, never concurrently) and that an interceptor failure tears the
//! session down like any transport error instead of propagating.

use crate::devices::AmtInfo;
use crate::relay::RelayPurpose;

/// Per-session data-transform pair.
///
/// Implementations may hold parser state across calls (both methods take
/// `&mut self`); the bridge serializes calls within a direction and never
/// runs the two directions' transforms on the same chunk.
pub trait ProtocolInterceptor: Send {
    /// Transform client → device data before it reaches the backend channel.
    fn process_outbound(&mut self, data: &[u8]) -> Result<Vec<u8>, String>;

    /// Transform device → client data before it reaches the client
    /// connection.
    fn process_inbound(&mut self, data: &[u8]) -> Result<Vec<u8>, String>;
}

/// Collaborator that decides whether a session gets an interceptor, based on
/// the relay purpose and the device's embedded-protocol credentials.
pub trait InterceptorFactory: Send + Sync {
    fn for_session(
        &self,
        purpose: RelayPurpose,
        amt: Option<&AmtInfo>,
    ) -> Option<Box<dyn ProtocolInterceptor>>;
}

/// Factory used when no interception collaborator is attached: sessions
/// relay raw bytes untouched.
pub struct NoInterceptors;

impl InterceptorFactory for NoInterceptors {
    fn for_session(
        &self,
        _purpose: RelayPurpose,
        _amt: Option<&AmtInfo>,
    ) -> Option<Box<dyn ProtocolInterceptor>> {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ProtocolInterceptor;
    use std::sync::{Arc, Mutex};

    /// Test interceptor that tags each chunk with a direction prefix and
    /// logs every invocation as `(outbound, original chunk)`.
    pub struct TaggingInterceptor {
        pub log: Arc<Mutex<Vec<(bool, Vec<u8>)>>>,
    }

    impl TaggingInterceptor {
        pub fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ProtocolInterceptor for TaggingInterceptor {
        fn process_outbound(&mut self, data: &[u8]) -> Result<Vec<u8>, String> {
            self.log.lock().unwrap().push((true, data.to_vec()));
            let mut out = b"O:".to_vec();
            out.extend_from_slice(data);
            Ok(out)
        }

        fn process_inbound(&mut self, data: &[u8]) -> Result<Vec<u8>, String> {
            self.log.lock().unwrap().push((false, data.to_vec()));
            let mut out = b"I:".to_vec();
            out.extend_from_slice(data);
            Ok(out)
        }
    }

    /// Test interceptor that fails on the nth outbound chunk.
    pub struct FailingInterceptor {
        pub fail_after: usize,
        seen: usize,
    }

    impl FailingInterceptor {
        pub fn new(fail_after: usize) -> Self {
            Self {
                fail_after,
                seen: 0,
            }
        }
    }

    impl ProtocolInterceptor for FailingInterceptor {
        fn process_outbound(&mut self, data: &[u8]) -> Result<Vec<u8>, String> {
            self.seen += 1;
            if self.seen > self.fail_after {
                return Err("parser desync".to_string());
            }
            Ok(data.to_vec())
        }

        fn process_inbound(&mut self, data: &[u8]) -> Result<Vec<u8>, String> {
            Ok(data.to_vec())
        }
    }
}
