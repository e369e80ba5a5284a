// src/core/crypt/mod.rs

//! Crypt Keyset: sealing and unsealing the Secret Data Encryption Key (SDEK)
//! under a password and an optional recovery mnemonic.

pub mod keyset;
pub mod recovery;
pub mod sdek;

pub use keyset::CryptKeyset;
pub use recovery::RecoveryMnemonic;
pub use sdek::Sdek;
