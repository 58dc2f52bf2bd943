// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Bridge capability sets.

use bitflags::bitflags;

bitflags! {
    /// Capabilities a bridge declares at registration time. `CALL`, `INIT`
    /// and `CLEANUP` are mandatory; the rest are optional refinements the
    /// gateway and orchestrator probe before delegating.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BridgeCaps: u32 {
        const CALL                = 1 << 0;
        const INIT                = 1 << 1;
        const CLEANUP             = 1 << 2;
        const VALIDATE_TRANSITION = 1 << 3;
        const EMIT_TRACE          = 1 << 4;
    }
}

impl BridgeCaps {
    /// The capabilities every bridge must declare.
    pub const REQUIRED: BridgeCaps = BridgeCaps::CALL
        .union(BridgeCaps::INIT)
        .union(BridgeCaps::CLEANUP);

    /// Returns true when the mandatory capabilities are all present.
    pub fn is_complete(self) -> bool {
        self.contains(BridgeCaps::REQUIRED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_caps_are_enforced() {
        assert!(BridgeCaps::REQUIRED.is_complete());
        assert!(!(BridgeCaps::CALL | BridgeCaps::INIT).is_complete());
        assert!((BridgeCaps::REQUIRED | BridgeCaps::EMIT_TRACE).is_complete());
    }
}
