//! Caller callbacks invoked by the client and its driver.
//!
//! Every hook is optional; an unset hook is skipped. Hooks run synchronously
//! on the task driving the batch, so a slow hook stalls every in-flight
//! request.

use std::fmt;

use crate::{Completion, RequestDescriptor, RequestOptions, TransferError};

/// Called at enqueue time with the merged option overlay of one request.
/// The returned overlay is used for that request only.
pub type PreRequestHook =
    Box<dyn FnMut(&str, &RequestDescriptor, RequestOptions) -> RequestOptions + Send>;
/// Called for every drained request, failed transfers included
pub type CompletedHook = Box<dyn FnMut(&str, &Completion) + Send>;
/// Called for every request that failed at the transport
pub type ErrorHook = Box<dyn FnMut(&str, &TransferError) + Send>;
/// Called on a driver pass that drained nothing while requests are in flight
pub type IdleHook = Box<dyn FnMut() + Send>;

/// The four hooks of a client
#[derive(Default)]
pub struct Hooks {
    pub(crate) pre_request: Option<PreRequestHook>,
    pub(crate) completed: Option<CompletedHook>,
    pub(crate) error: Option<ErrorHook>,
    pub(crate) idle: Option<IdleHook>,
}

impl Hooks {
    pub(crate) fn pre_request(
        &mut self,
        key: &str,
        descriptor: &RequestDescriptor,
        options: RequestOptions,
    ) -> RequestOptions {
        match &mut self.pre_request {
            Some(hook) => hook(key, descriptor, options),
            None => options,
        }
    }

    pub(crate) fn completed(&mut self, key: &str, completion: &Completion) {
        if let Some(hook) = &mut self.completed {
            hook(key, completion);
        }
    }

    pub(crate) fn error(&mut self, key: &str, error: &TransferError) {
        if let Some(hook) = &mut self.error {
            hook(key, error);
        }
    }

    pub(crate) fn idle(&mut self) {
        if let Some(hook) = &mut self.idle {
            hook();
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_request", &self.pre_request.is_some())
            .field("completed", &self.completed.is_some())
            .field("error", &self.error.is_some())
            .field("idle", &self.idle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unset_hooks_are_skipped() {
        let mut hooks = Hooks::default();
        let descriptor = RequestDescriptor::try_from("http://example.com/").unwrap();
        let options = RequestOptions {
            timeout: Some(Duration::from_secs(3)),
            ..RequestOptions::default()
        };
        assert_eq!(hooks.pre_request("a", &descriptor, options.clone()), options);
        hooks.idle();
    }

    #[test]
    fn test_pre_request_returns_overlay() {
        let mut hooks = Hooks {
            pre_request: Some(Box::new(
                |key: &str, _: &RequestDescriptor, mut options: RequestOptions| {
                    if key == "slow" {
                        options.timeout = Some(Duration::from_secs(60));
                    }
                    options
                },
            )),
            ..Hooks::default()
        };
        let descriptor = RequestDescriptor::try_from("http://example.com/").unwrap();

        let slow = hooks.pre_request("slow", &descriptor, RequestOptions::default());
        let fast = hooks.pre_request("fast", &descriptor, RequestOptions::default());
        assert_eq!(slow.timeout, Some(Duration::from_secs(60)));
        assert_eq!(fast.timeout, None);
        assert_eq!(
            format!("{hooks:?}"),
            "Hooks { pre_request: true, completed: false, error: false, idle: false }"
        );
    }
}
