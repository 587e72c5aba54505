pub(crate) mod sync_wrapper;
pub(crate) use sync_wrapper::SyncWrapper;

#[cfg(test)]
pub(crate) mod tracker;
