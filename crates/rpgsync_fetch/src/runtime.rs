use {
    core::future::Future,
    std::sync::OnceLock,
    tokio::runtime::{Builder, Handle, Runtime},
};

/// Handle to the `tokio` runtime which downloads run on.
///
/// [`FetchRuntime::default`] uses a multi-threaded runtime created the first
/// time it is needed and shared by every default handle afterwards. Use
/// `FetchRuntime::from(handle)` to download on a runtime you already own.
#[derive(Debug, Clone)]
pub struct FetchRuntime {
    handle: Handle,
}

impl Default for FetchRuntime {
    fn default() -> Self {
        static SHARED: OnceLock<Runtime> = OnceLock::new();

        let runtime = SHARED.get_or_init(|| {
            Builder::new_multi_thread()
                .enable_all()
                .thread_name("rpgsync-fetch")
                .build()
                .expect("failed to create tokio runtime")
        });
        Self::from(runtime.handle().clone())
    }
}

impl From<Handle> for FetchRuntime {
    fn from(handle: Handle) -> Self {
        Self { handle }
    }
}

impl FetchRuntime {
    /// Runs `future` in the background.
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        drop(self.handle.spawn(future));
    }
}
