//! L4 port-range to value/mask expansion
//!
//! OpenFlow cannot match an arbitrary inclusive port range directly, so a
//! range is rewritten as a list of `value/mask` matches over the 16-bit port
//! field. Strings are lowercase hex, zero-padded to four digits; a singleton
//! is printed without a mask.

/// Expand the inclusive range `[port_min, port_max]` into ofctl port matches.
///
/// The range is split at the highest bit where `port_min` and `port_max`
/// diverge. The lower half is covered by walking the unset bits of
/// `port_min` upward, the upper half by walking the set bits of `port_max`
/// downward; bit 0 on each side becomes a singleton or a `/0xfffe` pair.
///
/// An inverted range yields no matches.
pub fn port_rule_masking(port_min: u16, port_max: u16) -> Vec<String> {
    if port_max < port_min {
        return Vec::new();
    }
    if port_min == port_max {
        return vec![hex16(port_min)];
    }

    let diverge = 15 - (port_min ^ port_max).leading_zeros() as u16;
    if diverge == 0 {
        // The ports differ only in bit 0: one two-port block covers both.
        return vec![format!("{}/0xfffe", hex16(port_min))];
    }

    let mut rules = Vec::new();

    // Lower half: [port_min, end of port_min's side of the split).
    if port_min & 1 != 0 {
        rules.push(hex16(port_min));
    } else {
        rules.push(format!("{}/0xfffe", hex16(port_min)));
    }
    for bit in 1..diverge {
        let block = 1u16 << bit;
        if port_min & block == 0 {
            let value = (port_min & !(block - 1)) | block;
            rules.push(format!("{}/{}", hex16(value), hex16(!(block - 1))));
        }
    }

    // Upper half: down from the split point to port_max.
    for bit in (1..diverge).rev() {
        let block = 1u16 << bit;
        if port_max & block != 0 {
            rules.push(format!("{}/{}", hex16(port_max & !block), hex16(!(block - 1))));
        }
    }
    if port_max & 1 != 0 {
        rules.push(format!("{}/0xfffe", hex16(port_max & !1)));
    } else {
        rules.push(hex16(port_max));
    }

    rules
}

fn hex16(value: u16) -> String {
    format!("{value:#06x}")
}
