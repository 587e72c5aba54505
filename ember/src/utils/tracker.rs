use crate::task::Id;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Launch,
    Resume,
    Destroy,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Launch { id: Id },
    Resume { id: Id },
    Destroy { id: Id },
    Fault { id: Id, message: String },
}

impl Call {
    fn method(&self) -> Method {
        match self {
            Call::Launch { .. } => Method::Launch,
            Call::Resume { .. } => Method::Resume,
            Call::Destroy { .. } => Method::Destroy,
            Call::Fault { .. } => Method::Fault,
        }
    }

    fn id(&self) -> Id {
        match self {
            Call::Launch { id }
            | Call::Resume { id }
            | Call::Destroy { id }
            | Call::Fault { id, .. } => *id,
        }
    }
}

/// Log of the calls a `TaskManager` made on behalf of its tasks, grouped by
/// method.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, call: Call) {
        self.calls.entry(call.method()).or_default().push(call);
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }

    /// Calls of `method` made for task `id`.
    pub(crate) fn calls_for(&self, method: &Method, id: Id) -> usize {
        self.calls.get(method).map_or(0, |calls| {
            calls.iter().filter(|call| call.id() == id).count()
        })
    }
}
