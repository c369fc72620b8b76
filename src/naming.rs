use chrono::{Datelike, NaiveDateTime, Timelike};
use thiserror::Error;

/// Minute resolution: two runs started a minute apart never share names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("{kind} name is empty")]
    Empty { kind: &'static str },

    #[error("{kind} name {name:?} is {length} characters long, the limit is {max}")]
    TooLong {
        kind: &'static str,
        name: String,
        length: usize,
        max: usize,
    },

    #[error("{kind} name {name:?} contains invalid character {character:?}")]
    InvalidCharacter {
        kind: &'static str,
        name: String,
        character: char,
    },

    #[error("{kind} name {name:?} must start with a letter or digit")]
    InvalidStart { kind: &'static str, name: String },

    #[error("{kind} name {name:?} may not end with {character:?}")]
    InvalidEnd {
        kind: &'static str,
        name: String,
        character: char,
    },

    #[error("image version component {0} does not fit a 32-bit integer")]
    VersionOverflow(u64),
}

/// Naming constraints for one family of Azure resources.
struct Rule {
    max: usize,
    allowed: fn(char) -> bool,
    /// Characters that are allowed in the middle of a name but not at its end.
    forbidden_end: &'static [char],
}

/// Snapshots, disks, images, network resources.
const GENERAL: Rule = Rule {
    max: 80,
    allowed: |c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'),
    forbidden_end: &['.', '-'],
};

const RESOURCE_GROUP: Rule = Rule {
    max: 90,
    allowed: |c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '(' | ')'),
    forbidden_end: &['.'],
};

const VIRTUAL_MACHINE: Rule = Rule {
    max: 64,
    ..GENERAL
};

const VIRTUAL_NETWORK: Rule = Rule {
    max: 64,
    ..GENERAL
};

impl Rule {
    fn check(&self, kind: &'static str, name: &str) -> Result<(), Error> {
        let first = name.chars().next().ok_or(Error::Empty { kind })?;
        let length = name.chars().count();
        if length > self.max {
            return Err(Error::TooLong {
                kind,
                name: name.to_string(),
                length,
                max: self.max,
            });
        }
        if let Some(character) = name.chars().find(|c| !(self.allowed)(*c)) {
            return Err(Error::InvalidCharacter {
                kind,
                name: name.to_string(),
                character,
            });
        }
        if !first.is_ascii_alphanumeric() {
            return Err(Error::InvalidStart {
                kind,
                name: name.to_string(),
            });
        }
        match name.chars().last() {
            Some(character) if self.forbidden_end.contains(&character) => Err(Error::InvalidEnd {
                kind,
                name: name.to_string(),
                character,
            }),
            _ => Ok(()),
        }
    }
}

/// Every name a capture run uses, derived once from the source VM name and the
/// build time.
#[derive(Debug, Clone, PartialEq)]
pub struct Names {
    pub timestamp: String,
    pub snapshot: String,
    pub resource_group: String,
    pub disk: String,
    pub virtual_network: String,
    pub subnet: String,
    pub security_group: String,
    pub public_address: String,
    pub network_interface: String,
    pub virtual_machine: String,
    pub image: String,
    /// `<major>.<yyyyMM>.<dHHmm>`
    ///
    /// Increases with the build time at minute resolution: the middle component
    /// orders months and the last one orders minutes within a month.
    pub image_version: String,
}

impl Names {
    /// Derive and validate the name set for `vm_name` built at `at`.
    /// Fails on the first name that would be rejected by the platform.
    pub fn derive(vm_name: &str, at: NaiveDateTime, version_major: u32) -> Result<Self, Error> {
        if vm_name.is_empty() {
            return Err(Error::Empty {
                kind: "source virtual machine",
            });
        }
        let timestamp = at.format(TIMESTAMP_FORMAT).to_string();
        let base = format!("{vm_name}{timestamp}");

        let names = Self {
            snapshot: base.clone(),
            resource_group: format!("{base}_ImageRG"),
            disk: format!("{base}_OsDisk"),
            virtual_network: format!("{base}_VNet"),
            subnet: format!("{base}_Subnet"),
            security_group: format!("{base}_NSG"),
            public_address: format!("{base}_PIP"),
            network_interface: format!("{base}_NIC"),
            virtual_machine: format!("{base}_VM"),
            image: format!("{vm_name}Image{timestamp}"),
            image_version: image_version(version_major, at)?,
            timestamp,
        };
        names.validate()?;
        Ok(names)
    }

    fn validate(&self) -> Result<(), Error> {
        GENERAL.check("snapshot", &self.snapshot)?;
        RESOURCE_GROUP.check("resource group", &self.resource_group)?;
        GENERAL.check("disk", &self.disk)?;
        VIRTUAL_NETWORK.check("virtual network", &self.virtual_network)?;
        GENERAL.check("subnet", &self.subnet)?;
        GENERAL.check("network security group", &self.security_group)?;
        GENERAL.check("public IP address", &self.public_address)?;
        GENERAL.check("network interface", &self.network_interface)?;
        VIRTUAL_MACHINE.check("virtual machine", &self.virtual_machine)?;
        GENERAL.check("image", &self.image)
    }
}

fn image_version(major: u32, at: NaiveDateTime) -> Result<String, Error> {
    let year_month = at.year() as u64 * 100 + at.month() as u64;
    let day_time = at.day() as u64 * 10_000 + at.hour() as u64 * 100 + at.minute() as u64;
    for component in [major as u64, year_month, day_time] {
        if component > i32::MAX as u64 {
            return Err(Error::VersionOverflow(component));
        }
    }
    Ok(format!("{major}.{year_month}.{day_time}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(hour, minute, 7)
            .unwrap()
    }

    #[test]
    fn derives_timestamp_qualified_names() {
        let names = Names::derive("web01", at(19, 15, 42), 1).unwrap();
        assert_eq!(names.timestamp, "202610191542");
        assert_eq!(names.snapshot, "web01202610191542");
        assert_eq!(names.resource_group, "web01202610191542_ImageRG");
        assert_eq!(names.image, "web01Image202610191542");
        assert_eq!(names.virtual_machine, "web01202610191542_VM");
        assert_eq!(names.image_version, "1.202610.191542");
    }

    #[test]
    fn image_version_has_no_leading_zeros() {
        let names = Names::derive("web01", at(5, 0, 9), 3).unwrap();
        assert_eq!(names.image_version, "3.202610.50009");
    }

    #[test]
    fn names_one_minute_apart_differ() {
        let first = Names::derive("web01", at(19, 15, 42), 1).unwrap();
        let second = Names::derive("web01", at(19, 15, 43), 1).unwrap();
        assert_ne!(first.snapshot, second.snapshot);
        assert_ne!(first.resource_group, second.resource_group);
        assert_ne!(first.image, second.image);
        assert_ne!(first.image_version, second.image_version);
    }

    #[test]
    fn rejects_empty_names() {
        assert_eq!(
            Names::derive("", at(19, 15, 42), 1),
            Err(Error::Empty {
                kind: "source virtual machine"
            })
        );
        assert_eq!(
            GENERAL.check("image", ""),
            Err(Error::Empty { kind: "image" })
        );
    }

    #[test]
    fn rejects_names_over_the_length_limit() {
        let vm_name = "a".repeat(70);
        let err = Names::derive(&vm_name, at(19, 15, 42), 1).unwrap_err();
        assert!(matches!(err, Error::TooLong { kind: "snapshot", max: 80, .. }));
    }

    #[test]
    fn rejects_invalid_characters() {
        let err = Names::derive("web 01", at(19, 15, 42), 1).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidCharacter {
                kind: "snapshot",
                name: "web 01202610191542".into(),
                character: ' ',
            }
        );
    }

    #[test]
    fn rejects_invalid_start() {
        let err = Names::derive("-web01", at(19, 15, 42), 1).unwrap_err();
        assert!(matches!(err, Error::InvalidStart { kind: "snapshot", .. }));
    }

    #[test]
    fn resource_group_rule_allows_parentheses_but_not_trailing_period() {
        assert!(RESOURCE_GROUP.check("resource group", "web(01)_ImageRG").is_ok());
        assert!(matches!(
            RESOURCE_GROUP.check("resource group", "web01."),
            Err(Error::InvalidEnd { character: '.', .. })
        ));
    }

    #[test]
    fn every_derived_name_is_within_limits() {
        let vm_name = "a".repeat(40);
        let names = Names::derive(&vm_name, at(31, 23, 59), 1).unwrap();
        for name in [
            &names.snapshot,
            &names.disk,
            &names.subnet,
            &names.security_group,
            &names.public_address,
            &names.network_interface,
            &names.image,
        ] {
            assert!(name.len() <= 80, "{name}");
        }
        assert!(names.virtual_network.len() <= 64);
        assert!(names.virtual_machine.len() <= 64);
        assert!(names.resource_group.len() <= 90);
    }
}
