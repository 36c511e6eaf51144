use std::ffi::{CStr, CString};

use libc::{c_char, c_int};

use super::{call, registry, ResultEnvelope};
use crate::logging::init_logger;

fn envelope_to_c(json: String) -> *mut c_char {
    match CString::new(json) {
        Ok(s) => s.into_raw(),
        Err(_) => {
            let fallback = ResultEnvelope::<()>::err("result contains an interior NUL byte").to_json();
            CString::new(fallback)
                .map(CString::into_raw)
                .unwrap_or(std::ptr::null_mut())
        }
    }
}

fn arg_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, String> {
    if ptr.is_null() {
        return Err(format!("{what} is NULL"));
    }
    let c_str = unsafe { CStr::from_ptr(ptr) };
    c_str
        .to_str()
        .map_err(|e| format!("invalid UTF-8 in {what}: {e}"))
}

// --- API Functions ---

/// Installs the stderr logger and builds the method registry.
/// Returns 0 on success, -1 if the registry is unusable.
#[no_mangle]
pub extern "C" fn taxcount_init(verbose: c_int) -> c_int {
    init_logger(verbose != 0);
    match registry() {
        Ok(_) => 0,
        Err(e) => {
            log::error!("{e}");
            -1
        }
    }
}

/// Runs `method` with the JSON object `args_json`.
///
/// Always returns an envelope string (`{"ok":...}` or `{"err":...}`), which the
/// caller releases with [`taxcount_string_free`].
#[no_mangle]
pub extern "C" fn taxcount_call(method: *const c_char, args_json: *const c_char) -> *mut c_char {
    let method = match arg_str(method, "method") {
        Ok(s) => s,
        Err(msg) => return envelope_to_c(ResultEnvelope::<()>::err(msg).to_json()),
    };
    let args = match arg_str(args_json, "args_json") {
        Ok(s) => s,
        Err(msg) => return envelope_to_c(ResultEnvelope::<()>::err(msg).to_json()),
    };
    envelope_to_c(call(method, args).to_json())
}

#[no_mangle]
pub extern "C" fn taxcount_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

#[cfg(test)]
mod c_api_tests {
    use super::*;

    fn call_c(method: Option<&str>, args: &str) -> String {
        let method = method.map(|m| CString::new(m).unwrap());
        let args = CString::new(args).unwrap();
        let ptr = taxcount_call(
            method.as_ref().map_or(std::ptr::null(), |m| m.as_ptr()),
            args.as_ptr(),
        );
        assert!(!ptr.is_null());
        let out = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        taxcount_string_free(ptr);
        out
    }

    #[test]
    fn test_init_is_repeatable() {
        assert_eq!(taxcount_init(0), 0);
        assert_eq!(taxcount_init(1), 0);
    }

    #[test]
    fn test_call_round_trip() {
        let out = call_c(Some("version"), "{}");
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["ok"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_null_method_is_err_envelope() {
        let out = call_c(None, "{}");
        assert_eq!(out, r#"{"err":{"message":"method is NULL"}}"#);
    }

    #[test]
    fn test_free_null_is_noop() {
        taxcount_string_free(std::ptr::null_mut());
    }
}
