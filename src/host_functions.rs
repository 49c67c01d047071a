//! Host Function Table: the static, capability-gated host import catalog.
//!
//! Every host import a guest module can call is listed here exactly once,
//! paired with the [`Capability`](crate::capability::Capability) that gates
//! it. The table itself is engine-agnostic — wiring a binding's
//! [`HostFn`] into a concrete WASM engine is the job of the Runtime
//! implementation (see [`crate::runtime::wasmtime_runtime`]).
//!
//! A native implementation here **must not** re-check capabilities: gating
//! happens once, at instantiation, by omitting ungranted bindings from the
//! import set (`crate::manager`, step 3). A function in this table runs
//! unconditionally once the guest has successfully linked against it.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::capability::Capability;
use crate::value::{Value, ValueType};

/// Error returned by a native host function implementation.
///
/// Surfaces as a trap in the guest (see `runtime::wasmtime_runtime`); it
/// never carries capability information, since by construction a bound
/// native function already had its capability granted.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("guest memory access out of bounds: offset {offset}, len {len}")]
    OutOfBounds { offset: u32, len: u32 },
    #[error("host operation failed: {0}")]
    Failed(String),
    #[error("native host function panicked: {0}")]
    Panic(String),
}

/// Narrow view of a running guest's linear memory, given to native host
/// functions. Implemented by the Runtime so the Host Function Table stays
/// engine-agnostic.
pub trait HostContext {
    /// Copy `len` bytes starting at `offset` out of guest memory.
    fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>, HostError>;

    /// Copy `data` into guest memory starting at `offset`.
    fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<(), HostError>;
}

/// Uniform native host function signature.
pub type HostFn = fn(&mut dyn HostContext, &[Value]) -> Result<Vec<Value>, HostError>;

/// One entry of the Host Function Table: an import name, the capability
/// gating it, its static signature, and its native implementation.
pub struct HostFunctionBinding {
    /// WASM import module namespace, e.g. `"env"`.
    pub namespace: &'static str,
    /// WASM import field name, e.g. `"fs_read"`.
    pub name: &'static str,
    /// Capability required to include this binding in an invocation's imports.
    pub capability: Capability,
    pub params: &'static [ValueType],
    pub results: &'static [ValueType],
    pub native: HostFn,
}

/// The process-wide, read-only Host Function Table.
///
/// Keyed by `(namespace, name)`; see [`find_binding`].
pub static HOST_FUNCTION_TABLE: &[HostFunctionBinding] = &[
    HostFunctionBinding {
        namespace: "env",
        name: "fs_read",
        capability: Capability::FilesystemRead,
        params: &[ValueType::I32, ValueType::I32, ValueType::I32, ValueType::I32],
        results: &[ValueType::I32],
        native: host_fs_read,
    },
    HostFunctionBinding {
        namespace: "env",
        name: "fs_write",
        capability: Capability::FilesystemWrite,
        params: &[ValueType::I32, ValueType::I32, ValueType::I32, ValueType::I32],
        results: &[ValueType::I32],
        native: host_fs_write,
    },
    HostFunctionBinding {
        namespace: "env",
        name: "net_connect",
        capability: Capability::Network,
        params: &[ValueType::I32, ValueType::I32, ValueType::I32],
        results: &[ValueType::I32],
        native: host_net_connect,
    },
    HostFunctionBinding {
        namespace: "env",
        name: "time_now",
        capability: Capability::Time,
        params: &[],
        results: &[ValueType::I64],
        native: host_time_now,
    },
    HostFunctionBinding {
        namespace: "env",
        name: "random_fill",
        capability: Capability::Random,
        params: &[ValueType::I32, ValueType::I32],
        results: &[ValueType::I32],
        native: host_random_fill,
    },
    HostFunctionBinding {
        namespace: "env",
        name: "host_log",
        capability: Capability::HostCall,
        params: &[ValueType::I32, ValueType::I32],
        results: &[],
        native: host_log,
    },
];

/// Look up a binding by its import coordinates.
pub fn find_binding(namespace: &str, name: &str) -> Option<&'static HostFunctionBinding> {
    HOST_FUNCTION_TABLE
        .iter()
        .find(|b| b.namespace == namespace && b.name == name)
}

fn args_i32(args: &[Value], index: usize) -> Result<i32, HostError> {
    args.get(index)
        .and_then(|v| v.as_i32())
        .ok_or_else(|| HostError::Failed(format!("expected i32 argument at index {index}")))
}

/// `fs_read(path_ptr, path_len, buf_ptr, buf_len) -> bytes_read_or_negative_one`
fn host_fs_read(ctx: &mut dyn HostContext, args: &[Value]) -> Result<Vec<Value>, HostError> {
    let path_ptr = args_i32(args, 0)? as u32;
    let path_len = args_i32(args, 1)? as u32;
    let buf_ptr = args_i32(args, 2)? as u32;
    let buf_len = args_i32(args, 3)? as u32;

    let path_bytes = ctx.read_memory(path_ptr, path_len)?;
    let path = String::from_utf8(path_bytes).map_err(|e| HostError::Failed(e.to_string()))?;

    let contents = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "fs_read failed");
            return Ok(vec![Value::I32(-1)]);
        }
    };

    let copy_len = contents.len().min(buf_len as usize);
    ctx.write_memory(buf_ptr, &contents[..copy_len])?;
    Ok(vec![Value::I32(copy_len as i32)])
}

/// `fs_write(path_ptr, path_len, buf_ptr, buf_len) -> bytes_written_or_negative_one`
fn host_fs_write(ctx: &mut dyn HostContext, args: &[Value]) -> Result<Vec<Value>, HostError> {
    let path_ptr = args_i32(args, 0)? as u32;
    let path_len = args_i32(args, 1)? as u32;
    let buf_ptr = args_i32(args, 2)? as u32;
    let buf_len = args_i32(args, 3)? as u32;

    let path_bytes = ctx.read_memory(path_ptr, path_len)?;
    let path = String::from_utf8(path_bytes).map_err(|e| HostError::Failed(e.to_string()))?;
    let contents = ctx.read_memory(buf_ptr, buf_len)?;

    match std::fs::write(&path, &contents) {
        Ok(()) => Ok(vec![Value::I32(contents.len() as i32)]),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "fs_write failed");
            Ok(vec![Value::I32(-1)])
        }
    }
}

/// `net_connect(host_ptr, host_len, port) -> 1_if_connected_else_0`
fn host_net_connect(ctx: &mut dyn HostContext, args: &[Value]) -> Result<Vec<Value>, HostError> {
    use std::net::TcpStream;
    use std::time::Duration;

    let host_ptr = args_i32(args, 0)? as u32;
    let host_len = args_i32(args, 1)? as u32;
    let port = args_i32(args, 2)? as u16;

    let host_bytes = ctx.read_memory(host_ptr, host_len)?;
    let host = String::from_utf8(host_bytes).map_err(|e| HostError::Failed(e.to_string()))?;

    let addr = format!("{host}:{port}");
    let connected = TcpStream::connect_timeout(
        &addr
            .parse()
            .map_err(|e| HostError::Failed(format!("invalid address {addr}: {e}")))?,
        Duration::from_millis(200),
    )
    .is_ok();

    Ok(vec![Value::I32(connected as i32)])
}

/// `time_now() -> nanoseconds_since_unix_epoch`
fn host_time_now(_ctx: &mut dyn HostContext, _args: &[Value]) -> Result<Vec<Value>, HostError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| HostError::Failed(e.to_string()))?;
    Ok(vec![Value::I64(now.as_nanos() as i64)])
}

/// `random_fill(ptr, len) -> len_written`
fn host_random_fill(ctx: &mut dyn HostContext, args: &[Value]) -> Result<Vec<Value>, HostError> {
    use rand::RngCore;

    let ptr = args_i32(args, 0)? as u32;
    let len = args_i32(args, 1)? as u32;

    let mut buf = vec![0u8; len as usize];
    rand::thread_rng().fill_bytes(&mut buf);
    ctx.write_memory(ptr, &buf)?;
    Ok(vec![Value::I32(len as i32)])
}

/// `host_log(ptr, len)`: emits a guest-provided UTF-8 message at `info` level.
fn host_log(ctx: &mut dyn HostContext, args: &[Value]) -> Result<Vec<Value>, HostError> {
    let ptr = args_i32(args, 0)? as u32;
    let len = args_i32(args, 1)? as u32;

    let bytes = ctx.read_memory(ptr, len)?;
    let message = String::from_utf8_lossy(&bytes);
    tracing::info!(target: "munition::guest", "{message}");
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMemory(Vec<u8>);

    impl HostContext for FakeMemory {
        fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>, HostError> {
            let start = offset as usize;
            let end = start + len as usize;
            self.0
                .get(start..end)
                .map(|s| s.to_vec())
                .ok_or(HostError::OutOfBounds { offset, len })
        }

        fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<(), HostError> {
            let start = offset as usize;
            let end = start + data.len();
            if end > self.0.len() {
                return Err(HostError::OutOfBounds { offset, len: data.len() as u32 });
            }
            self.0[start..end].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn find_binding_locates_known_import() {
        let binding = find_binding("env", "time_now").unwrap();
        assert_eq!(binding.capability, Capability::Time);
    }

    #[test]
    fn find_binding_returns_none_for_unknown_import() {
        assert!(find_binding("env", "does_not_exist").is_none());
    }

    #[test]
    fn every_binding_capability_is_unique_per_name() {
        // Sanity check: no duplicate (namespace, name) pairs in the table.
        for (i, a) in HOST_FUNCTION_TABLE.iter().enumerate() {
            for b in &HOST_FUNCTION_TABLE[i + 1..] {
                assert!(!(a.namespace == b.namespace && a.name == b.name));
            }
        }
    }

    #[test]
    fn host_time_now_returns_an_i64() {
        let mut mem = FakeMemory(vec![0; 8]);
        let result = host_time_now(&mut mem, &[]).unwrap();
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], Value::I64(_)));
    }

    #[test]
    fn host_random_fill_writes_into_memory() {
        let mut mem = FakeMemory(vec![0; 16]);
        let result = host_random_fill(&mut mem, &[Value::I32(0), Value::I32(16)]).unwrap();
        assert_eq!(result, vec![Value::I32(16)]);
    }

    #[test]
    fn host_log_reads_utf8_message() {
        let mut mem = FakeMemory(b"hello".to_vec());
        let result = host_log(&mut mem, &[Value::I32(0), Value::I32(5)]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn out_of_bounds_read_is_rejected() {
        let mem = FakeMemory(vec![0; 4]);
        let err = mem.read_memory(0, 8).unwrap_err();
        assert!(matches!(err, HostError::OutOfBounds { .. }));
    }
}
