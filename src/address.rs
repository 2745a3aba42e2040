//! Structured code/data addresses used as the universal key for all location-indexed structures

/// The tag describing what kind of location a [`MetaAddress`] points at.
///
/// `Invalid` must stay the lowest variant: the invalid sentinel has to sort before every valid
/// address of the same address space and epoch, which the model's sorted-edge lookups rely on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum AddressKind {
    /// The invalid sentinel tag
    Invalid,
    /// A generic (data) address
    Generic,
    /// An instruction boundary
    Code,
}

impl AddressKind {
    pub fn name(self) -> &'static str {
        match self {
            AddressKind::Invalid => "Invalid",
            AddressKind::Generic => "Generic",
            AddressKind::Code => "Code",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Invalid" => Some(AddressKind::Invalid),
            "Generic" => Some(AddressKind::Generic),
            "Code" => Some(AddressKind::Code),
            _ => None,
        }
    }
}

/// A structured program address: address space, epoch (for self-modifying or re-mapped code),
/// address-type tag, and the raw value.
///
/// Ordering is lexicographic on (space, epoch, kind, address), so all containers keyed by
/// `MetaAddress` have a total, deterministic order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaAddress {
    pub space: u16,
    pub epoch: u32,
    pub kind: AddressKind,
    pub address: u64,
}

impl MetaAddress {
    /// The invalid sentinel. Compares like any other value; reports `!is_valid()`.
    pub fn invalid() -> Self {
        Self {
            space: 0,
            epoch: 0,
            kind: AddressKind::Invalid,
            address: 0,
        }
    }

    /// A code address in the default address space and epoch. Most lifted-code addresses take
    /// this form.
    pub fn code(address: u64) -> Self {
        Self {
            space: 0,
            epoch: 0,
            kind: AddressKind::Code,
            address,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind != AddressKind::Invalid
    }

    /// Parse the textual form produced by `Display`, returning `None` if unsuccessful.
    pub fn parse_from(s: &str) -> Option<Self> {
        if s == "invalid" {
            return Some(Self::invalid());
        }
        let mut parts = s.split(':');
        let space = parts.next()?.parse().ok()?;
        let epoch = parts.next()?.parse().ok()?;
        let kind = AddressKind::from_name(parts.next()?)?;
        let address = u64::from_str_radix(parts.next()?.strip_prefix("0x")?, 16).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            space,
            epoch,
            kind,
            address,
        })
    }
}

impl std::fmt::Display for MetaAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if !self.is_valid() {
            write!(f, "invalid")
        } else {
            write!(
                f,
                "{}:{}:{}:{:#x}",
                self.space,
                self.epoch,
                self.kind.name(),
                self.address
            )
        }
    }
}

impl std::fmt::Debug for MetaAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
