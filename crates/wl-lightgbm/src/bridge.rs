//! Marshaling between host values and sandbox linear memory.
//!
//! The sandbox can neither see host memory nor hand back heap buffers of
//! unknown size, so every value crosses the boundary by explicit copy:
//!
//! - inputs are copied into freshly allocated sandbox buffers,
//! - out-parameters are zeroed 4-byte slots read back after the call,
//! - variable-length outputs use the two-pass protocol
//!   ([`query_length`] then [`fetch_with_length`]).
//!
//! [`Scope`] owns every buffer it allocates and releases all of them when it
//! is dropped, so an early `?` return cannot leak sandbox memory.

use crate::engine::{AbiFn, Ptr, Sandbox};
use crate::error::{Error, Result};

// =============================================================================
// Raw Primitives
// =============================================================================

/// Allocate `n_bytes` of sandbox memory. The caller must [`release`] it.
pub fn allocate(sandbox: &mut dyn Sandbox, n_bytes: usize) -> Result<Ptr> {
    let size = to_i32(n_bytes.max(1), "allocation size")?;
    let ptr = Ptr::from_ret(sandbox.call(AbiFn::Malloc, &[size])?);
    if ptr.is_null() {
        return Err(Error::Sandbox(format!(
            "out of sandbox memory allocating {n_bytes} bytes"
        )));
    }
    Ok(ptr)
}

/// Release memory obtained from [`allocate`]. Null is a no-op.
pub fn release(sandbox: &mut dyn Sandbox, ptr: Ptr) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    sandbox.call(AbiFn::Free, &[ptr.as_arg()])?;
    Ok(())
}

/// Narrow a host length to the engine's 32-bit ABI.
///
/// Sizes beyond `i32::MAX` cannot be addressed in this deployment.
pub fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::Validation(format!("{what} {value} exceeds the 32-bit engine limit")))
}

// =============================================================================
// Scope
// =============================================================================

/// Scoped access to a sandbox with automatic release of scratch buffers.
pub struct Scope<'a> {
    sandbox: &'a mut dyn Sandbox,
    allocations: Vec<Ptr>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(sandbox: &'a mut dyn Sandbox) -> Self {
        Self {
            sandbox,
            allocations: Vec::new(),
        }
    }

    /// Allocate a scratch buffer owned by this scope.
    pub fn alloc(&mut self, n_bytes: usize) -> Result<Ptr> {
        let ptr = allocate(self.sandbox, n_bytes)?;
        self.allocations.push(ptr);
        Ok(ptr)
    }

    /// Copy raw bytes into a new scratch buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<Ptr> {
        let ptr = self.alloc(bytes.len())?;
        self.sandbox.write(ptr, bytes)?;
        Ok(ptr)
    }

    /// Copy a string into a new scratch buffer with a single NUL terminator.
    pub fn write_str(&mut self, s: &str) -> Result<Ptr> {
        self.write_c_bytes(s.as_bytes())
    }

    /// Like [`write_str`](Self::write_str) for text that may not be UTF-8.
    pub fn write_c_bytes(&mut self, bytes: &[u8]) -> Result<Ptr> {
        if bytes.contains(&0) {
            return Err(Error::Validation(
                "string passed to the engine contains an interior NUL byte".into(),
            ));
        }
        let mut buf = Vec::with_capacity(bytes.len() + 1);
        buf.extend_from_slice(bytes);
        buf.push(0);
        self.write_bytes(&buf)
    }

    /// Copy a float32 array into a new scratch buffer.
    pub fn write_f32s(&mut self, values: &[f32]) -> Result<Ptr> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes(&bytes)
    }

    /// A zeroed 4-byte out-parameter slot.
    pub fn write_i32_slot(&mut self) -> Result<Ptr> {
        self.write_bytes(&0i32.to_le_bytes())
    }

    pub fn read_i32(&mut self, ptr: Ptr) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.sandbox.read(ptr, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self, ptr: Ptr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.sandbox.read(ptr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_f64s(&mut self, ptr: Ptr, count: usize) -> Result<Vec<f64>> {
        let bytes = self.read_bytes(ptr, count * 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect())
    }

    /// Read a NUL-terminated string.
    pub fn read_c_string(&mut self, ptr: Ptr) -> Result<String> {
        const MAX_LEN: usize = 1 << 20;
        if ptr.is_null() {
            return Ok(String::new());
        }
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        // Byte-wise: a chunked read could run past the end of linear memory.
        loop {
            self.sandbox.read(ptr.offset(out.len()), &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
            if out.len() >= MAX_LEN {
                return Err(Error::Sandbox("unterminated string in sandbox memory".into()));
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Invoke an export and return its raw result.
    pub fn call(&mut self, func: AbiFn, args: &[i32]) -> Result<i32> {
        self.sandbox.call(func, args)
    }

    /// Invoke an export that returns a status code.
    ///
    /// A nonzero status becomes [`Error::NativeCall`] carrying the engine's
    /// last-error text, read before anything else can overwrite it.
    pub fn check(&mut self, func: AbiFn, args: &[i32]) -> Result<()> {
        let status = self.sandbox.call(func, args)?;
        if status != 0 {
            let message = self.last_error_message()?;
            return Err(Error::NativeCall {
                call: func.symbol(),
                message,
            });
        }
        Ok(())
    }

    /// The engine's diagnostic for the most recent failing call.
    ///
    /// Only meaningful right after a nonzero status; the next call
    /// overwrites it.
    pub fn last_error_message(&mut self) -> Result<String> {
        let ptr = Ptr::from_ret(self.sandbox.call(AbiFn::GetLastError, &[])?);
        self.read_c_string(ptr)
    }

    /// Number of buffers this scope will release on drop.
    pub fn outstanding(&self) -> usize {
        self.allocations.len()
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        for ptr in self.allocations.drain(..).rev() {
            if let Err(err) = release(self.sandbox, ptr) {
                tracing::warn!(ptr = ptr.0, error = %err, "failed to release sandbox buffer");
            }
        }
    }
}

// =============================================================================
// Two-Pass Output Protocol
// =============================================================================

/// First pass: call with a null buffer of capacity zero to learn the
/// required length.
///
/// `call` receives `(scope, capacity, out_len_slot, buffer)` and must issue
/// the engine call.
pub fn query_length<F>(scope: &mut Scope<'_>, mut call: F) -> Result<usize>
where
    F: FnMut(&mut Scope<'_>, i32, Ptr, Ptr) -> Result<()>,
{
    let out_len = scope.write_i32_slot()?;
    call(scope, 0, out_len, Ptr::NULL)?;
    let len = scope.read_i32(out_len)?;
    usize::try_from(len)
        .map_err(|_| Error::Sandbox(format!("engine reported negative output length {len}")))
}

/// Second pass: allocate exactly `len` bytes, call again, and return the
/// bytes the engine reports having written.
pub fn fetch_with_length<F>(scope: &mut Scope<'_>, len: usize, mut call: F) -> Result<Vec<u8>>
where
    F: FnMut(&mut Scope<'_>, i32, Ptr, Ptr) -> Result<()>,
{
    let capacity = to_i32(len, "output length")?;
    let out_len = scope.write_i32_slot()?;
    let buffer = scope.alloc(len)?;
    call(scope, capacity, out_len, buffer)?;
    let written = scope.read_i32(out_len)?;
    let written = usize::try_from(written)
        .ok()
        .filter(|&w| w <= len)
        .ok_or_else(|| {
            Error::Sandbox(format!(
                "engine reported {written} bytes written into a {len}-byte buffer"
            ))
        })?;
    scope.read_bytes(buffer, written)
}
