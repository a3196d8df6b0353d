//! Windows integrated authentication (`authentication_windows_client`).
//!
//! The client runs the SSPI `Negotiate` package and trades opaque tokens
//! with the server until the security context is established. SSPI only
//! exists on Windows; elsewhere the plugin reports itself unsupported.

#[cfg(not(windows))]
use sqlwire_core::{ConnectionErrorKind, Error};
use sqlwire_core::Result;

/// Login name sent when none is configured. The server maps the Windows
/// account instead.
pub const DEFAULT_USER: &str = "auth_windows";

/// SSPI client context for one authentication exchange.
#[cfg(windows)]
pub struct WindowsAuth {
    inner: imp::Context,
}

/// Stand-in where SSPI does not exist: construction always fails.
#[cfg(not(windows))]
#[derive(Debug)]
pub struct WindowsAuth {
    _private: (),
}

impl WindowsAuth {
    /// Acquire outbound credentials for the current Windows logon.
    #[cfg(windows)]
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: imp::Context::new()?,
        })
    }

    #[cfg(not(windows))]
    pub fn new() -> Result<Self> {
        Err(Error::connection(
            ConnectionErrorKind::Unsupported,
            "authentication_windows_client needs SSPI and is only available on Windows",
        ))
    }

    /// Advance the context with the server's token (`None` on the first
    /// round). Returns the token to send, or `None` once nothing is left
    /// to say.
    #[cfg(windows)]
    pub fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        self.inner.step(server_token)
    }

    #[cfg(not(windows))]
    #[allow(clippy::unnecessary_wraps)]
    pub fn step(&mut self, _server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[cfg(windows)]
impl std::fmt::Debug for WindowsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsAuth")
            .field("established", &self.inner.established)
            .finish_non_exhaustive()
    }
}

#[cfg(windows)]
#[allow(unsafe_code)]
mod imp {
    use std::ptr;

    use sqlwire_core::{ConnectionErrorKind, Error, Result};
    use winapi::shared::sspi::{
        AcquireCredentialsHandleW, CompleteAuthToken, CredHandle, CtxtHandle,
        DeleteSecurityContext, FreeCredentialsHandle, InitializeSecurityContextW,
        SECBUFFER_TOKEN, SECBUFFER_VERSION, SECPKG_CRED_OUTBOUND, SECURITY_NETWORK_DREP, SecBuffer,
        SecBufferDesc, TimeStamp,
    };
    use winapi::shared::winerror::{
        SEC_E_OK, SEC_I_COMPLETE_AND_CONTINUE, SEC_I_COMPLETE_NEEDED, SEC_I_CONTINUE_NEEDED,
    };

    const MAX_TOKEN_SIZE: usize = 12_288;

    pub(super) struct Context {
        credentials: CredHandle,
        context: Option<CtxtHandle>,
        pub(super) established: bool,
    }

    fn sspi_error(call: &str, status: i32) -> Error {
        Error::connection(
            ConnectionErrorKind::Authentication,
            format!("{call} failed with status 0x{status:08X}"),
        )
    }

    impl Context {
        pub(super) fn new() -> Result<Self> {
            let mut package: Vec<u16> = "Negotiate".encode_utf16().chain(Some(0)).collect();
            // SAFETY: SecHandle and TimeStamp are plain data; all-zero is a valid value.
            let mut credentials: CredHandle = unsafe { std::mem::zeroed() };
            let mut expiry: TimeStamp = unsafe { std::mem::zeroed() };
            // SAFETY: every pointer is valid for the duration of the call and
            // `package` is NUL-terminated.
            let status = unsafe {
                AcquireCredentialsHandleW(
                    ptr::null_mut(),
                    package.as_mut_ptr(),
                    SECPKG_CRED_OUTBOUND,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    None,
                    ptr::null_mut(),
                    &mut credentials,
                    &mut expiry,
                )
            };
            if status != SEC_E_OK {
                return Err(sspi_error("AcquireCredentialsHandle", status));
            }
            Ok(Self {
                credentials,
                context: None,
                established: false,
            })
        }

        pub(super) fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
            if self.established {
                return Ok(None);
            }

            let mut out = vec![0u8; MAX_TOKEN_SIZE];
            let mut out_buffer = SecBuffer {
                cbBuffer: MAX_TOKEN_SIZE as u32,
                BufferType: SECBUFFER_TOKEN,
                pvBuffer: out.as_mut_ptr().cast(),
            };
            let mut out_desc = SecBufferDesc {
                ulVersion: SECBUFFER_VERSION,
                cBuffers: 1,
                pBuffers: &mut out_buffer,
            };

            let mut input = server_token.map(<[u8]>::to_vec).unwrap_or_default();
            let mut in_buffer = SecBuffer {
                cbBuffer: input.len() as u32,
                BufferType: SECBUFFER_TOKEN,
                pvBuffer: input.as_mut_ptr().cast(),
            };
            let mut in_desc = SecBufferDesc {
                ulVersion: SECBUFFER_VERSION,
                cBuffers: 1,
                pBuffers: &mut in_buffer,
            };
            let input_ptr = if server_token.is_some() {
                ptr::from_mut(&mut in_desc)
            } else {
                ptr::null_mut()
            };
            let context_ptr = self.context.as_mut().map_or(ptr::null_mut(), ptr::from_mut);

            // SAFETY: zeroed handles are valid out-parameters.
            let mut new_context: CtxtHandle = unsafe { std::mem::zeroed() };
            let mut expiry: TimeStamp = unsafe { std::mem::zeroed() };
            let mut attributes = 0;
            // SAFETY: buffers outlive the call and their lengths match
            // their allocations.
            let status = unsafe {
                InitializeSecurityContextW(
                    &mut self.credentials,
                    context_ptr,
                    ptr::null_mut(),
                    0,
                    0,
                    SECURITY_NETWORK_DREP,
                    input_ptr,
                    0,
                    &mut new_context,
                    &mut out_desc,
                    &mut attributes,
                    &mut expiry,
                )
            };
            match status {
                SEC_E_OK | SEC_I_CONTINUE_NEEDED => {}
                SEC_I_COMPLETE_NEEDED | SEC_I_COMPLETE_AND_CONTINUE => {
                    // SAFETY: `new_context` was just initialized by SSPI.
                    let completed = unsafe { CompleteAuthToken(&mut new_context, &mut out_desc) };
                    if completed != SEC_E_OK {
                        return Err(sspi_error("CompleteAuthToken", completed));
                    }
                }
                _ => return Err(sspi_error("InitializeSecurityContext", status)),
            }

            self.context = Some(new_context);
            self.established = status == SEC_E_OK || status == SEC_I_COMPLETE_NEEDED;
            out.truncate(out_buffer.cbBuffer as usize);
            Ok(if out.is_empty() { None } else { Some(out) })
        }
    }

    impl Drop for Context {
        fn drop(&mut self) {
            // SAFETY: both handles came from SSPI and are released once.
            unsafe {
                if let Some(mut context) = self.context.take() {
                    DeleteSecurityContext(&mut context);
                }
                FreeCredentialsHandle(&mut self.credentials);
            }
        }
    }
}
