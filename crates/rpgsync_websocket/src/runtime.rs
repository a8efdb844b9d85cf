use core::future::Future;

cfg_if::cfg_if! {
    if #[cfg(target_family = "wasm")] {
        /// [`Send`] on native targets, and implemented by everything on WASM,
        /// where futures never leave the page's thread.
        pub trait MaybeSend {}
        impl<T> MaybeSend for T {}
    } else {
        /// [`Send`] on native targets, and implemented by everything on WASM,
        /// where futures never leave the page's thread.
        pub trait MaybeSend: Send {}
        impl<T: Send> MaybeSend for T {}
    }
}

/// Where the tasks driving WebSocket sockets run.
///
/// On native targets this is a `tokio` runtime, the only one
/// `tokio-tungstenite` works with. [`WebSocketRuntime::default`] uses a
/// multi-threaded runtime created on first use and shared afterwards, and
/// `WebSocketRuntime::from(handle)` uses one you already own.
///
/// In the browser, tasks are queued on the page's event loop through
/// `wasm-bindgen-futures`, and the default handle is all there is.
#[derive(Debug, Clone)]
pub struct WebSocketRuntime {
    #[cfg(not(target_family = "wasm"))]
    handle: tokio::runtime::Handle,
}

#[cfg(target_family = "wasm")]
#[expect(clippy::derivable_impls, reason = "fields differ per target")]
impl Default for WebSocketRuntime {
    fn default() -> Self {
        Self {}
    }
}

#[cfg(not(target_family = "wasm"))]
impl Default for WebSocketRuntime {
    fn default() -> Self {
        use {std::sync::OnceLock, tokio::runtime::Runtime};

        static SHARED: OnceLock<Runtime> = OnceLock::new();

        let runtime = SHARED.get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("rpgsync-websocket")
                .build()
                .expect("failed to create tokio runtime")
        });
        Self::from(runtime.handle().clone())
    }
}

#[cfg(not(target_family = "wasm"))]
impl From<tokio::runtime::Handle> for WebSocketRuntime {
    fn from(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl WebSocketRuntime {
    /// Runs `future` in the background.
    pub fn spawn(&self, future: impl Future<Output = ()> + MaybeSend + 'static) {
        #[cfg(target_family = "wasm")]
        wasm_bindgen_futures::spawn_local(future);

        #[cfg(not(target_family = "wasm"))]
        drop(self.handle.spawn(future));
    }
}
