//! WebAssembly artifact compilation.
//!
//! [`CompiledArtifact`] wraps a compiled Wasmtime [`Module`] with the
//! metadata the fleet needs for cache accounting.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use hive_common::EngineError;

/// A compiled WebAssembly module.
///
/// Thread-safe and shared across instantiations; the underlying Wasmtime
/// module is itself thread-safe.
#[derive(Clone)]
pub struct CompiledArtifact {
    module: Module,
    content_hash: String,
    source_bytes: u64,
    compiled_at: Instant,
}

impl CompiledArtifact {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` for invalid bytecode; this error is
    /// terminal for the owning module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, EngineError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            EngineError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);
        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self {
            module,
            content_hash,
            source_bytes: bytes.len() as u64,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, EngineError> {
        let module = Module::new(engine, wat)
            .map_err(|e| EngineError::compilation_failed(format!("WAT compilation failed: {e}")))?;

        Ok(Self {
            module,
            content_hash: compute_hash(wat.as_bytes()),
            source_bytes: wat.len() as u64,
            compiled_at: Instant::now(),
        })
    }

    /// The compiled Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Hash of the original bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Size of the source bytes.
    pub fn source_bytes(&self) -> u64 {
        self.source_bytes
    }

    /// When this artifact was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), EngineError> {
        if bytes.len() < 8 {
            return Err(EngineError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }
        if &bytes[0..4] != b"\0asm" {
            return Err(EngineError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("content_hash", &self.content_hash)
            .field("source_bytes", &self.source_bytes)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WasmEngine;
    use hive_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(CompiledArtifact::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        assert!(CompiledArtifact::validate_wasm_header(&[0x00, 0x61]).is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(CompiledArtifact::validate_wasm_header(bad).is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16); // 64-bit hex
    }

    #[test]
    fn test_module_compilation() {
        let engine = engine();
        let artifact = CompiledArtifact::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();

        assert!(!artifact.content_hash().is_empty());
        assert_eq!(artifact.source_bytes(), MINIMAL_WASM.len() as u64);
    }

    #[test]
    fn test_invalid_bytes_fail_compilation() {
        let engine = engine();
        let result = CompiledArtifact::from_bytes(engine.inner(), b"definitely not wasm");
        assert!(matches!(result, Err(EngineError::CompilationFailed { .. })));
    }

    #[test]
    fn test_wat_compilation() {
        let engine = engine();
        let artifact =
            CompiledArtifact::from_wat(engine.inner(), r#"(module (func (export "_start")))"#)
                .unwrap();
        assert!(!artifact.content_hash().is_empty());
    }
}
