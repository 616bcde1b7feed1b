//! Loaded shared libraries and bound entry points.
//!
//! Libraries are keyed by their lower-cased name and loaded once; bound
//! functions are cached per (library, symbol) so binding the same pair again
//! hands back the same handle.

use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;

use libloading::Library;

use crate::error::{InteropError, InteropResult};
use crate::runtime::native::NativeFunction;

#[derive(Default)]
pub struct LibraryTable {
    libraries: HashMap<String, Rc<Library>>,
    functions: HashMap<(String, String), Rc<NativeFunction>>,
}

impl LibraryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `name`, or return the already loaded library.
    pub fn load(&mut self, name: &str) -> InteropResult<Rc<Library>> {
        let key = normalize_name(name);
        if let Some(lib) = self.libraries.get(&key) {
            return Ok(lib.clone());
        }
        // Safety: loading a library runs its initialisers; callers of `bind`
        // accept that by naming the library.
        let lib = unsafe { Library::new(name) }.map_err(|e| {
            InteropError::resolution(format!("cannot load library '{}': {}", name, e))
        })?;
        log::debug!("loaded library '{}'", name);
        let lib = Rc::new(lib);
        self.libraries.insert(key, lib.clone());
        Ok(lib)
    }

    /// Resolve `symbol` in `library`.
    pub fn bind(&mut self, library: &str, symbol: &str) -> InteropResult<Rc<NativeFunction>> {
        let key = (normalize_name(library), symbol.to_string());
        if let Some(func) = self.functions.get(&key) {
            return Ok(func.clone());
        }
        let lib = self.load(library)?;
        let addr = {
            // Safety: the symbol is only read as an address, never called here.
            let sym = unsafe { lib.get::<*mut c_void>(symbol.as_bytes()) }.map_err(|e| {
                InteropError::resolution(format!(
                    "symbol '{}' not found in '{}': {}",
                    symbol, library, e
                ))
            })?;
            *sym as usize
        };
        if addr == 0 {
            return Err(InteropError::resolution(format!(
                "symbol '{}' in '{}' resolved to null",
                symbol, library
            )));
        }
        log::debug!("bound {}!{} at {:#x}", library, symbol, addr);
        let func = NativeFunction::bound(addr, lib, library, symbol);
        self.functions.insert(key, func.clone());
        Ok(func)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.libraries.contains_key(&normalize_name(name))
    }

    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_a_resolution_error() {
        let mut table = LibraryTable::new();
        let err = table.bind("no-such-library-xyz", "f").err().unwrap();
        assert!(err.is_resolution());
        assert_eq!(table.library_count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bind_is_cached_and_missing_symbols_fail() {
        let mut table = LibraryTable::new();
        let a = table.bind("libc.so.6", "strlen").unwrap();
        let b = table.bind("LIBC.so.6", "strlen").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.symbol(), "strlen");
        assert_ne!(a.address(), 0);
        assert_eq!(table.library_count(), 1);

        let err = table.bind("libc.so.6", "no_such_symbol_xyz").err().unwrap();
        assert!(err.is_resolution());
        assert!(table.is_loaded("libc.so.6"));
    }
}
