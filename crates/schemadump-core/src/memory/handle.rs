use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};

/// Scoped owner of a kernel handle.
///
/// Move-only: ownership transfers on assignment and the handle is closed
/// exactly once, when the final owner is dropped. Null and
/// `INVALID_HANDLE_VALUE` are both treated as the empty state and are never
/// passed to `CloseHandle`.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    /// The underlying handle, for use with OS calls. The handle stays owned
    /// by `self`.
    pub fn raw(&self) -> HANDLE {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.0.is_null() && self.0 != INVALID_HANDLE_VALUE
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}
