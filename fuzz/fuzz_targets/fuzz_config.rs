//! Fuzz target: configuration parsing
//!
//! Feeds arbitrary bytes through the config tree and module-definition
//! parser, verifying:
//! - No panics under arbitrary byte inputs
//! - Every parsed definition has a 1-32 byte instance name
//! - Init level overrides never exceed 100
//! - Dotted lookups never panic, whatever the path
//!
//! cargo fuzz run fuzz_config

#![no_main]

use fwkernel::config::{ConfigRead, ConfigTree, ModuleDefinition};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Split: first line is a lookup path, the rest is the document.
    let (path, doc) = match data.iter().position(|&b| b == b'\n') {
        Some(i) => (&data[..i], &data[i + 1..]),
        None => (&[][..], data),
    };

    let Ok(mut tree) = ConfigTree::from_slice(doc) else {
        return;
    };

    if let Ok(entries) = tree.module_entries() {
        for entry in entries {
            if let Ok(Some(def)) = ModuleDefinition::from_entry(entry) {
                assert!(!def.instance_name.is_empty());
                assert!(def.instance_name.len() <= 32);
                if let Some(level) = def.init_level {
                    assert!(level.get() <= 100);
                }
            }
        }
    }

    let path = String::from_utf8_lossy(path);
    let _ = tree.get(&path);
    let _ = tree.get_int(&path, 0);
    let _ = tree.get_string(&path, "");
    if tree.set(&path, serde_json::Value::Bool(true)).is_ok() {
        assert_eq!(tree.bool(&path), Ok(true));
    }
});
