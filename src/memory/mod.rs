pub(crate) mod allocator;
pub(crate) mod best_fit;
pub(crate) mod bin_cache;
pub(crate) mod buffered;
pub(crate) mod division;
pub(crate) mod error;
pub(crate) mod locked;
pub(crate) mod record;
pub(crate) mod stats;
pub(crate) mod system;
pub(crate) mod vm;

#[cfg(test)]
pub(crate) mod stub;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
