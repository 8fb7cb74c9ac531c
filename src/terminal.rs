use crate::os_glue;
use std::io::Result;
use std::panic::PanicInfo;
use std::sync::Arc;

/// Raw, no-echo terminal mode held by the Capture role
///
/// Acquiring saves the current terminal mode and switches to raw
/// mode.  Dropping the guard restores the saved mode.
///
/// # Panic handling
///
/// When Rust panics, the terminal must be restored to its normal
/// state otherwise things would be left in a bad state for the user
/// (in raw mode with no echo, requiring the user to blindly type
/// `reset` on the command-line).  So while the guard is held, a
/// panic hook is installed that restores the saved mode before
/// calling on to the previous panic handler.  Any custom panic
/// handler needed by the application must be set up before the call
/// to [`RawMode::acquire`].
pub struct RawMode {
    saved: libc::termios,
    restored: bool,
    hook: PanicHook,
}

impl RawMode {
    /// Switch stdin's terminal to raw mode.  Fails if stdin is not a
    /// TTY or the mode can't be changed.
    pub fn acquire() -> Result<Self> {
        let saved = os_glue::termios_set_raw()?;
        let hook = PanicHook::install(move || {
            let _ = os_glue::termios_restore(&saved);
        });
        Ok(Self {
            saved,
            restored: false,
            hook,
        })
    }

    /// Restore the saved mode now.  Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        self.hook.uninstall();
        os_glue::termios_restore(&self.saved)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("{}", e);
        }
    }
}

type HookFn = Box<dyn Fn(&PanicInfo<'_>) + 'static + Sync + Send>;

// Panic hook running a cleanup before the hook it replaced.  The
// replaced hook is kept so that it can be put back afterwards.
struct PanicHook {
    prev: Arc<HookFn>,
}

impl PanicHook {
    fn install(cleanup: impl Fn() + 'static + Sync + Send) -> Self {
        let prev = Arc::new(std::panic::take_hook());
        let defhook = prev.clone();
        std::panic::set_hook(Box::new(move |info| {
            cleanup();
            defhook(info);
        }));
        Self { prev }
    }

    fn uninstall(&self) {
        // Discard our hook
        let _ = std::panic::take_hook();
        let prev = self.prev.clone();
        std::panic::set_hook(Box::new(move |info| prev(info)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_previous_hook_survives_release() {
        static APP: AtomicUsize = AtomicUsize::new(0);
        static CLEANUP: AtomicUsize = AtomicUsize::new(0);

        std::panic::set_hook(Box::new(|_| {
            APP.fetch_add(1, Ordering::SeqCst);
        }));
        let hook = PanicHook::install(|| {
            CLEANUP.fetch_add(1, Ordering::SeqCst);
        });
        let _ = std::panic::catch_unwind(|| panic!("while held"));
        assert_eq!(CLEANUP.load(Ordering::SeqCst), 1);
        assert_eq!(APP.load(Ordering::SeqCst), 1);

        hook.uninstall();
        let _ = std::panic::catch_unwind(|| panic!("after release"));
        assert_eq!(CLEANUP.load(Ordering::SeqCst), 1);
        assert_eq!(APP.load(Ordering::SeqCst), 2);

        // Back to the default hook
        let _ = std::panic::take_hook();
    }
}
