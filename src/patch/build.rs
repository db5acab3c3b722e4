//! Patch construction for host tooling and tests.
//!
//! [`PatchWriter`] emits individual instructions; [`diff`] produces a
//! complete patch from two images with a greedy seed-and-extend match.
//! Output is accepted by [`super::apply`] and by stock janpatch.

use std::collections::HashMap;

use super::{BKT, DEL, EQL, ESC, INS, MOD};

/// Shortest source match worth an `EQL` instead of literal bytes.
const MIN_MATCH: usize = 8;
const SEED: usize = 4;
/// Candidate positions remembered per seed.
const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Default)]
pub struct PatchWriter {
    out: Vec<u8>,
}

impl PatchWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal(&mut self, len: u32) -> &mut Self {
        self.counted(EQL, len)
    }

    pub fn delete(&mut self, len: u32) -> &mut Self {
        self.counted(DEL, len)
    }

    pub fn backtrack(&mut self, len: u32) -> &mut Self {
        self.counted(BKT, len)
    }

    /// Literal bytes replacing the same number of source bytes.
    pub fn modify(&mut self, data: &[u8]) -> &mut Self {
        self.literal(MOD, data)
    }

    /// Literal bytes; source untouched.
    pub fn insert(&mut self, data: &[u8]) -> &mut Self {
        self.literal(INS, data)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.out)
    }

    fn counted(&mut self, op: u8, len: u32) -> &mut Self {
        if len > 0 {
            self.out.extend_from_slice(&[ESC, op]);
            encode_length(&mut self.out, len);
        }
        self
    }

    fn literal(&mut self, op: u8, data: &[u8]) -> &mut Self {
        if data.is_empty() {
            return self;
        }
        self.out.extend_from_slice(&[ESC, op]);
        for &b in data {
            self.out.push(b);
            if b == ESC {
                self.out.push(ESC);
            }
        }
        self
    }
}

fn encode_length(out: &mut Vec<u8>, len: u32) {
    match len {
        0 => {}
        1..=252 => out.push((len - 1) as u8),
        253..=508 => out.extend_from_slice(&[252, (len - 253) as u8]),
        509..=0xFFFF => {
            out.push(253);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            out.push(254);
            out.extend_from_slice(&len.to_be_bytes());
        }
    }
}

fn seed_at(data: &[u8], pos: usize) -> Option<[u8; SEED]> {
    data.get(pos..pos + SEED)?.try_into().ok()
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Diff `old` into `new`.
///
/// Images larger than `u32::MAX` are outside the patch format and not
/// supported.
pub fn diff(old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut index: HashMap<[u8; SEED], Vec<usize>> = HashMap::new();
    for pos in 0..old.len().saturating_sub(SEED - 1) {
        if let Some(seed) = seed_at(old, pos) {
            let slot = index.entry(seed).or_default();
            if slot.len() < MAX_CANDIDATES {
                slot.push(pos);
            }
        }
    }

    let mut w = PatchWriter::new();
    let mut cursor = 0usize;
    let mut pending: Vec<u8> = Vec::new();
    let mut i = 0usize;

    while i < new.len() {
        // Prefer continuing at the cursor, then any indexed candidate.
        let at_cursor = (cursor + pending.len() <= old.len())
            .then(|| common_prefix(&old[cursor + pending.len()..], &new[i..]))
            .unwrap_or(0);
        let mut best = (cursor + pending.len(), at_cursor);
        if best.1 < MIN_MATCH {
            if let Some(candidates) = seed_at(new, i).and_then(|s| index.get(&s)) {
                for &pos in candidates {
                    let len = common_prefix(&old[pos..], &new[i..]);
                    if len > best.1 {
                        best = (pos, len);
                    }
                }
            }
        }

        let (pos, len) = best;
        if len < MIN_MATCH {
            pending.push(new[i]);
            i += 1;
            continue;
        }

        if pos == cursor + pending.len() {
            w.modify(&pending);
        } else {
            w.insert(&pending);
            if pos > cursor {
                w.delete((pos - cursor) as u32);
            } else {
                w.backtrack((cursor - pos) as u32);
            }
        }
        pending.clear();
        w.equal(len as u32);
        cursor = pos + len;
        i += len;
    }

    w.insert(&pending);
    w.finish()
}
