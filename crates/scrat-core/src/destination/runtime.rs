use std::sync::LazyLock;

/// Tokio runtime bridging the async SFTP stack into the synchronous
/// destination interface. Created lazily on first use.
pub(crate) static ASYNC_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to create tokio runtime for the sftp destination")
});
