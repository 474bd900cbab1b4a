use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("failed to open clipboard")]
    Open,
    #[error("failed to write clipboard: {0}")]
    Write(String),
}

/// Destination for copied secrets. Tests swap in an in-memory sink.
pub trait ClipboardSink: Send + Sync {
    fn write_text(&self, value: &str) -> Result<(), ClipboardError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardSink for SystemClipboard {
    fn write_text(&self, value: &str) -> Result<(), ClipboardError> {
        write_system_clipboard_text(value)?;
        debug!(chars = value.chars().count(), "clipboard updated");
        Ok(())
    }
}

#[cfg(target_os = "windows")]
fn write_system_clipboard_text(value: &str) -> Result<(), ClipboardError> {
    use windows_sys::Win32::System::DataExchange::{
        CloseClipboard, EmptyClipboard, OpenClipboard, SetClipboardData,
    };
    use windows_sys::Win32::System::Memory::{
        GlobalAlloc, GlobalFree, GlobalLock, GlobalUnlock, GMEM_MOVEABLE,
    };

    const CF_UNICODETEXT: u32 = 13;

    let wide: Vec<u16> = value.encode_utf16().chain(std::iter::once(0)).collect();
    let bytes = wide.len() * std::mem::size_of::<u16>();
    unsafe {
        if OpenClipboard(std::ptr::null_mut()) == 0 {
            return Err(ClipboardError::Open);
        }
        if EmptyClipboard() == 0 {
            CloseClipboard();
            return Err(ClipboardError::Write("clear failed".to_string()));
        }

        let mem = GlobalAlloc(GMEM_MOVEABLE, bytes);
        if mem.is_null() {
            CloseClipboard();
            return Err(ClipboardError::Write("allocation failed".to_string()));
        }

        let ptr = GlobalLock(mem) as *mut u16;
        if ptr.is_null() {
            GlobalFree(mem);
            CloseClipboard();
            return Err(ClipboardError::Write("lock failed".to_string()));
        }
        std::ptr::copy_nonoverlapping(wide.as_ptr(), ptr, wide.len());
        GlobalUnlock(mem);

        // Ownership of `mem` passes to the clipboard only on success.
        if SetClipboardData(CF_UNICODETEXT, mem).is_null() {
            GlobalFree(mem);
            CloseClipboard();
            return Err(ClipboardError::Write("set data failed".to_string()));
        }

        CloseClipboard();
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn write_system_clipboard_text(value: &str) -> Result<(), ClipboardError> {
    let mut clipboard = arboard::Clipboard::new().map_err(|_| ClipboardError::Open)?;
    clipboard
        .set_text(value.to_string())
        .map_err(|err| ClipboardError::Write(err.to_string()))
}
