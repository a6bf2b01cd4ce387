//! Pageant backend.
//!
//! Pageant does not listen on a socket. A client creates a named file
//! mapping, writes the framed request into it, and sends the mapping's name
//! to Pageant's hidden window with `WM_COPYDATA`. Pageant answers in place
//! before the message returns.
//!
//! The mapping is owned by, and only accessible to, the current user's SID.
//! Pageant refuses mappings owned by anyone else, and nobody else may read
//! the key material that passes through it.
//!
//! ## Safety contracts
//!
//! Every `unsafe` block here is a Win32 call. Handles and allocations are
//! wrapped in guards that release them on drop, so early returns cannot
//! leak them; no raw pointer outlives the guard it was taken from.

use std::ffi::c_void;
use std::io;
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_TIMEOUT, GetLastError, HANDLE, HLOCAL, INVALID_HANDLE_VALUE, LocalFree,
};
use windows_sys::Win32::Security::Authorization::{
    ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW,
};
use windows_sys::Win32::Security::{
    GetTokenInformation, SECURITY_ATTRIBUTES, TOKEN_QUERY, TOKEN_USER, TokenUser,
};
use windows_sys::Win32::System::DataExchange::COPYDATASTRUCT;
use windows_sys::Win32::System::Memory::{
    CreateFileMappingA, FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
    PAGE_READWRITE, UnmapViewOfFile,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThreadId, OpenProcessToken,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    FindWindowA, SMTO_ABORTIFHUNG, SendMessageTimeoutA, WM_COPYDATA,
};

use super::codec::LENGTH_PREFIX;
use super::{Bridge, BridgeError, BridgeReply, BridgeRequest};

/// Largest framed message Pageant accepts through the shared region.
pub const AGENT_MAX_MSGLEN: usize = 8192;

/// Magic `dwData` identifying an agent request to Pageant.
const AGENT_COPYDATA_ID: usize = 0x804e_50ba;

const PAGEANT_WINDOW: &[u8] = b"Pageant\0";

pub struct PageantBridge {
    timeout: Duration,
    descriptor: Option<UserDescriptor>,
}

impl PageantBridge {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            descriptor: None,
        }
    }

    fn descriptor(&mut self) -> Result<&UserDescriptor, BridgeError> {
        if self.descriptor.is_none() {
            self.descriptor = Some(UserDescriptor::current_user()?);
        }
        self.descriptor
            .as_ref()
            .ok_or_else(|| BridgeError::Unavailable("no security descriptor".to_string()))
    }

    fn exchange(&mut self, request: &BridgeRequest) -> Result<Vec<u8>, BridgeError> {
        let framed_len = LENGTH_PREFIX + request.payload.len();
        if framed_len > AGENT_MAX_MSGLEN {
            return Err(BridgeError::TooLarge {
                len: framed_len,
                max: AGENT_MAX_MSGLEN,
            });
        }

        let hwnd = unsafe { FindWindowA(PAGEANT_WINDOW.as_ptr(), PAGEANT_WINDOW.as_ptr()) };
        if hwnd.is_null() {
            return Err(BridgeError::Unavailable("Pageant window not found".to_string()));
        }

        // Keyed by thread so concurrent callers in one process never share a region.
        let map_name = format!("PageantRequest{:08x}\0", unsafe { GetCurrentThreadId() });
        let timeout_ms = u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX);
        let timeout = self.timeout;

        let descriptor = self.descriptor()?;
        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor.as_ptr(),
            bInheritHandle: 0,
        };

        let mapping = unsafe {
            CreateFileMappingA(
                INVALID_HANDLE_VALUE,
                &attributes,
                PAGE_READWRITE,
                0,
                AGENT_MAX_MSGLEN as u32,
                map_name.as_ptr(),
            )
        };
        if mapping.is_null() {
            return Err(BridgeError::Io(io::Error::last_os_error()));
        }
        let mapping = OwnedHandle(mapping);

        let view = unsafe { MapViewOfFile(mapping.0, FILE_MAP_WRITE, 0, 0, 0) };
        if view.Value.is_null() {
            return Err(BridgeError::Io(io::Error::last_os_error()));
        }
        let mut view = MappedView(view);

        let region = view.as_mut_slice();
        region[..LENGTH_PREFIX].copy_from_slice(&(request.payload.len() as u32).to_be_bytes());
        region[LENGTH_PREFIX..framed_len].copy_from_slice(&request.payload);

        let copy_data = COPYDATASTRUCT {
            dwData: AGENT_COPYDATA_ID,
            cbData: map_name.len() as u32,
            lpData: map_name.as_ptr() as *mut c_void,
        };

        let mut answered: usize = 0;
        let sent = unsafe {
            SendMessageTimeoutA(
                hwnd,
                WM_COPYDATA,
                0,
                &copy_data as *const COPYDATASTRUCT as isize,
                SMTO_ABORTIFHUNG,
                timeout_ms,
                &mut answered,
            )
        };
        if sent == 0 {
            return Err(match unsafe { GetLastError() } {
                ERROR_TIMEOUT => BridgeError::Timeout(timeout),
                _ => BridgeError::Unavailable(io::Error::last_os_error().to_string()),
            });
        }
        if answered == 0 {
            return Err(BridgeError::Protocol("Pageant rejected the request".to_string()));
        }

        let region = view.as_mut_slice();
        let mut header = [0u8; LENGTH_PREFIX];
        header.copy_from_slice(&region[..LENGTH_PREFIX]);
        let reply_len = u32::from_be_bytes(header) as usize;
        if reply_len > AGENT_MAX_MSGLEN - LENGTH_PREFIX {
            return Err(BridgeError::Protocol(format!(
                "reply length {reply_len} overruns shared region"
            )));
        }

        Ok(region[LENGTH_PREFIX..LENGTH_PREFIX + reply_len].to_vec())
    }
}

impl Bridge for PageantBridge {
    fn transact(&mut self, request: &BridgeRequest) -> Result<BridgeReply, BridgeError> {
        let payload = self.exchange(request)?;
        Ok(BridgeReply::new(request.id, payload))
    }

    fn name(&self) -> &'static str {
        "pageant"
    }
}

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

struct MappedView(MEMORY_MAPPED_VIEW_ADDRESS);

impl MappedView {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the view maps exactly AGENT_MAX_MSGLEN writable bytes and
        // lives as long as self.
        unsafe { std::slice::from_raw_parts_mut(self.0.Value as *mut u8, AGENT_MAX_MSGLEN) }
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        unsafe { UnmapViewOfFile(self.0) };
    }
}

struct LocalAlloc(*mut c_void);

impl Drop for LocalAlloc {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { LocalFree(self.0 as HLOCAL) };
        }
    }
}

/// Security descriptor owned by the current user that grants access to
/// that user alone.
struct UserDescriptor(LocalAlloc);

impl UserDescriptor {
    fn current_user() -> Result<Self, BridgeError> {
        let sid = current_user_sid()?;
        let sddl = wide(&format!("O:{sid}D:P(A;;GA;;;{sid})"));

        let mut descriptor: *mut c_void = ptr::null_mut();
        let mut size: u32 = 0;
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                1,
                &mut descriptor,
                &mut size,
            )
        };
        if ok == 0 || descriptor.is_null() {
            return Err(BridgeError::Io(io::Error::last_os_error()));
        }
        tracing::trace!(%sid, "Built owner-only security descriptor");
        Ok(Self(LocalAlloc(descriptor)))
    }

    fn as_ptr(&self) -> *mut c_void {
        (self.0).0
    }
}

fn current_user_sid() -> Result<String, BridgeError> {
    let mut token: HANDLE = ptr::null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
        return Err(BridgeError::Io(io::Error::last_os_error()));
    }
    let token = OwnedHandle(token);

    let mut needed: u32 = 0;
    unsafe { GetTokenInformation(token.0, TokenUser, ptr::null_mut(), 0, &mut needed) };
    if needed == 0 {
        return Err(BridgeError::Io(io::Error::last_os_error()));
    }

    // u64 backing keeps TOKEN_USER suitably aligned.
    let mut buf = vec![0u64; (needed as usize).div_ceil(8)];
    if unsafe {
        GetTokenInformation(
            token.0,
            TokenUser,
            buf.as_mut_ptr() as *mut c_void,
            needed,
            &mut needed,
        )
    } == 0
    {
        return Err(BridgeError::Io(io::Error::last_os_error()));
    }
    let user = unsafe { &*(buf.as_ptr() as *const TOKEN_USER) };

    let mut sid_str: *mut u16 = ptr::null_mut();
    if unsafe { ConvertSidToStringSidW(user.User.Sid, &mut sid_str) } == 0 || sid_str.is_null() {
        return Err(BridgeError::Io(io::Error::last_os_error()));
    }
    let owned = LocalAlloc(sid_str as *mut c_void);

    let len = (0..).take_while(|&i| unsafe { *sid_str.add(i) } != 0).count();
    let sid = String::from_utf16_lossy(unsafe { std::slice::from_raw_parts(sid_str, len) });
    drop(owned);
    Ok(sid)
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn oversized_request_is_rejected_before_lookup() {
        let mut bridge = PageantBridge::new(Duration::from_secs(1));
        let payload = Bytes::from(vec![0u8; AGENT_MAX_MSGLEN]);
        let err = bridge.transact(&BridgeRequest::new(payload)).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::TooLarge { len, max: AGENT_MAX_MSGLEN } if len == AGENT_MAX_MSGLEN + LENGTH_PREFIX
        ));
    }

    #[test]
    fn wide_strings_are_nul_terminated() {
        assert_eq!(wide("O:"), vec![b'O' as u16, b':' as u16, 0]);
    }
}
