// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! NUID generation: short, globally unique identifier strings.
//!
//! A NUID is 22 base62 characters: a 12 character random prefix plus a 10
//! character sequential part that advances by a random increment. The
//! prefix is re-randomized whenever the sequential part rolls over, so ids
//! stay unique across arbitrarily long runs while staying cheap to
//! generate. Inboxes, request tokens and dispatcher ids are all built from
//! these.

use rand::Rng;
use std::sync::{LazyLock, Mutex};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
/// 62^10; the sequential part rolls over at this value.
const MAX_SEQ: u64 = 839_299_365_868_340_224;
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;

/// Total length of a generated id.
pub const NUID_LEN: usize = PREFIX_LEN + SEQ_LEN;

/// A NUID generator.
#[derive(Debug)]
pub struct Nuid {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}

impl Nuid {
    /// Create a generator with a fresh random prefix.
    pub fn new() -> Self {
        let mut nuid = Nuid { prefix: [0; PREFIX_LEN], seq: 0, inc: 0 };
        nuid.randomize_prefix();
        nuid.reset_sequential();
        nuid
    }

    /// Produce the next id.
    pub fn next(&mut self) -> String {
        self.seq += self.inc;
        if self.seq >= MAX_SEQ {
            self.randomize_prefix();
            self.reset_sequential();
        }

        let mut out = [0u8; NUID_LEN];
        out[..PREFIX_LEN].copy_from_slice(&self.prefix);
        let mut rem = self.seq;
        for slot in out[PREFIX_LEN..].iter_mut().rev() {
            *slot = ALPHABET[(rem % BASE) as usize];
            rem /= BASE;
        }
        String::from_utf8(out.to_vec()).expect("alphabet is ASCII; qed")
    }

    fn randomize_prefix(&mut self) {
        let mut rng = rand::thread_rng();
        for slot in self.prefix.iter_mut() {
            *slot = ALPHABET[rng.gen_range(0..BASE) as usize];
        }
    }

    fn reset_sequential(&mut self) {
        let mut rng = rand::thread_rng();
        self.seq = rng.gen_range(0..MAX_SEQ / 2);
        self.inc = rng.gen_range(MIN_INC..MAX_INC);
    }
}

impl Default for Nuid {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: LazyLock<Mutex<Nuid>> = LazyLock::new(|| Mutex::new(Nuid::new()));

/// Produce the next id from the process-wide generator.
pub fn next() -> String {
    GLOBAL.lock().expect("nuid lock is never poisoned; qed").next()
}
