/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types common across the crate: inert newtypes, cryptographic primitives, and the
//! multi-signed message wrapper.

pub mod basic;

pub mod crypto_primitives;

pub mod signed_messages;
