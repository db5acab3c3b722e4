//! Fuzz target: `patch::apply`
//!
//! The first byte picks the paging window, the rest is split into a source
//! image and a patch.  Applying must never panic, and a successful apply
//! must report exactly the number of bytes it wrote.
//!
//! cargo fuzz run fuzz_patch_apply

#![no_main]

use fleetnode::patch::apply;
use fleetnode::patch::stream::MemoryStream;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&window, rest)) = data.split_first() else {
        return;
    };
    let split = rest.len() / 2;
    let (source, patch) = rest.split_at(split);

    let mut s = MemoryStream::new(source.to_vec());
    let mut p = MemoryStream::new(patch.to_vec());
    let mut t = MemoryStream::default();
    if let Ok(len) = apply(&mut s, &mut p, &mut t, usize::from(window)) {
        assert_eq!(len as usize, t.as_slice().len());
    }
});
