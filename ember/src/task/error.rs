use crate::task::Id;
use crate::utils::SyncWrapper;
use std::any::Any;
use std::fmt;

/// A task body panicked.
///
/// The panic is caught while polling, the future is dropped, and the fault is
/// stored in the task's result slot in place of a value. It reaches the
/// launcher through [`TaskHandle::get`](crate::task::TaskHandle::get) or by
/// awaiting the handle.
#[derive(thiserror::Error)]
#[error("task {id} panicked with message {message:?}")]
pub struct TaskFault {
    id: Id,
    message: String,
    payload: SyncWrapper<Box<dyn Any + Send + 'static>>,
}

impl TaskFault {
    pub(crate) fn panic(id: Id, payload: Box<dyn Any + Send + 'static>) -> TaskFault {
        let message = panic_payload_as_str(&*payload).unwrap_or("<non-string payload>").to_string();

        TaskFault {
            id,
            message,
            payload: SyncWrapper::new(payload),
        }
    }

    /// Id of the task that faulted.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Panic message, when the payload was a string.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Consumes the fault, returning the original panic payload. Useful to
    /// resume the panic with [`std::panic::resume_unwind`].
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.payload.into_inner()
    }
}

impl fmt::Debug for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFault")
            .field("id", &self.id)
            .field("message", &self.message)
            .finish()
    }
}

pub(crate) fn panic_payload_as_str(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<String>() {
        return Some(s);
    }

    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return Some(s);
    }

    None
}
