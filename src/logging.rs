/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Log-formatting helpers.
//!
//! The gadget logs through the [log](https://docs.rs/log/latest/log/) crate. To get the
//! messages printed onto a terminal or into a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! Block ids, digests, and public keys appear in log lines abbreviated to the first seven
//! characters of their Base64 encoding.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

// Get a more readable representation of a bytesequence by base64-encoding it and taking
// the first 7 characters.
pub(crate) fn abbrev(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}
