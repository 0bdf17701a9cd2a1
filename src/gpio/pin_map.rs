//! Static pin tables
//!
//! Maps the logical pin ids used in topics (`<base>/in/12`) to hardware line
//! descriptors. Tables are pure data, built once at startup and never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::DriverFamily;

/// Opaque hardware handle for one GPIO line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinDescriptor {
    line: u32,
    label: &'static str,
}

impl PinDescriptor {
    pub const fn new(line: u32, label: &'static str) -> Self {
        Self { line, label }
    }

    /// Kernel / SoC line number
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Display for PinDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {})", self.label, self.line)
    }
}

/// How logical pin ids in topics are interpreted
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PinNumbering {
    /// Physical header pin numbers
    #[default]
    Board,
    /// SoC line numbers (BCM on a Raspberry Pi)
    #[serde(alias = "bcm")]
    Soc,
}

/// Header layouts we ship tables for
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoardLayout {
    /// Allwinner H3/H2+ boards (Orange Pi One/PC/Zero family)
    #[serde(alias = "opi", alias = "orange_pi")]
    OrangePi,
    /// 40-pin Raspberry Pi header
    #[serde(alias = "rpi", alias = "raspberry_pi")]
    RaspberryPi,
}

impl BoardLayout {
    pub fn default_for(family: DriverFamily) -> Self {
        match family {
            DriverFamily::Rppal => BoardLayout::RaspberryPi,
            DriverFamily::Sysfs | DriverFamily::Mock => BoardLayout::OrangePi,
        }
    }

    fn table(self) -> &'static [(u32, PinDescriptor)] {
        match self {
            BoardLayout::OrangePi => ORANGE_PI_HEADER,
            BoardLayout::RaspberryPi => RASPBERRY_PI_HEADER,
        }
    }
}

impl fmt::Display for BoardLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardLayout::OrangePi => write!(f, "Orange Pi"),
            BoardLayout::RaspberryPi => write!(f, "Raspberry Pi"),
        }
    }
}

// Allwinner port lines: bank * 32 + index (PA = 0, PC = 2, PD = 3, PG = 6)
const fn pa(index: u32) -> u32 {
    index
}
const fn pc(index: u32) -> u32 {
    2 * 32 + index
}
const fn pd(index: u32) -> u32 {
    3 * 32 + index
}
const fn pg(index: u32) -> u32 {
    6 * 32 + index
}

const ORANGE_PI_HEADER: &[(u32, PinDescriptor)] = &[
    (3, PinDescriptor::new(pa(12), "PA12")),
    (5, PinDescriptor::new(pa(11), "PA11")),
    (7, PinDescriptor::new(pa(6), "PA6")),
    (8, PinDescriptor::new(pa(13), "PA13")),
    (10, PinDescriptor::new(pa(14), "PA14")),
    (11, PinDescriptor::new(pa(1), "PA1")),
    (12, PinDescriptor::new(pd(14), "PD14")),
    (13, PinDescriptor::new(pa(0), "PA0")),
    (15, PinDescriptor::new(pa(3), "PA3")),
    (16, PinDescriptor::new(pc(4), "PC4")),
    (18, PinDescriptor::new(pc(7), "PC7")),
    (19, PinDescriptor::new(pc(0), "PC0")),
    (21, PinDescriptor::new(pc(1), "PC1")),
    (22, PinDescriptor::new(pa(2), "PA2")),
    (23, PinDescriptor::new(pc(2), "PC2")),
    (24, PinDescriptor::new(pc(3), "PC3")),
    (26, PinDescriptor::new(pa(21), "PA21")),
    (27, PinDescriptor::new(pa(19), "PA19")),
    (28, PinDescriptor::new(pa(18), "PA18")),
    (29, PinDescriptor::new(pa(7), "PA7")),
    (31, PinDescriptor::new(pa(8), "PA8")),
    (32, PinDescriptor::new(pg(8), "PG8")),
    (33, PinDescriptor::new(pa(9), "PA9")),
    (35, PinDescriptor::new(pa(10), "PA10")),
    (36, PinDescriptor::new(pg(9), "PG9")),
    (37, PinDescriptor::new(pa(20), "PA20")),
    (38, PinDescriptor::new(pg(6), "PG6")),
    (40, PinDescriptor::new(pg(7), "PG7")),
];

const RASPBERRY_PI_HEADER: &[(u32, PinDescriptor)] = &[
    (3, PinDescriptor::new(2, "GPIO2")),
    (5, PinDescriptor::new(3, "GPIO3")),
    (7, PinDescriptor::new(4, "GPIO4")),
    (8, PinDescriptor::new(14, "GPIO14")),
    (10, PinDescriptor::new(15, "GPIO15")),
    (11, PinDescriptor::new(17, "GPIO17")),
    (12, PinDescriptor::new(18, "GPIO18")),
    (13, PinDescriptor::new(27, "GPIO27")),
    (15, PinDescriptor::new(22, "GPIO22")),
    (16, PinDescriptor::new(23, "GPIO23")),
    (18, PinDescriptor::new(24, "GPIO24")),
    (19, PinDescriptor::new(10, "GPIO10")),
    (21, PinDescriptor::new(9, "GPIO9")),
    (22, PinDescriptor::new(25, "GPIO25")),
    (23, PinDescriptor::new(11, "GPIO11")),
    (24, PinDescriptor::new(8, "GPIO8")),
    (26, PinDescriptor::new(7, "GPIO7")),
    (27, PinDescriptor::new(0, "GPIO0")),
    (28, PinDescriptor::new(1, "GPIO1")),
    (29, PinDescriptor::new(5, "GPIO5")),
    (31, PinDescriptor::new(6, "GPIO6")),
    (32, PinDescriptor::new(12, "GPIO12")),
    (33, PinDescriptor::new(13, "GPIO13")),
    (35, PinDescriptor::new(19, "GPIO19")),
    (36, PinDescriptor::new(16, "GPIO16")),
    (37, PinDescriptor::new(26, "GPIO26")),
    (38, PinDescriptor::new(20, "GPIO20")),
    (40, PinDescriptor::new(21, "GPIO21")),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PinMapError {
    #[error("Unknown pin {0}")]
    UnknownPin(u32),
}

/// Logical pin id → descriptor lookup
#[derive(Debug, Clone)]
pub struct PinMapper {
    layout: BoardLayout,
    numbering: PinNumbering,
    pins: BTreeMap<u32, PinDescriptor>,
}

impl PinMapper {
    pub fn new(layout: BoardLayout, numbering: PinNumbering) -> Self {
        let pins = layout
            .table()
            .iter()
            .map(|(header_pin, descriptor)| match numbering {
                PinNumbering::Board => (*header_pin, *descriptor),
                PinNumbering::Soc => (descriptor.line(), *descriptor),
            })
            .collect();

        Self {
            layout,
            numbering,
            pins,
        }
    }

    pub fn resolve(&self, logical_id: u32) -> Result<PinDescriptor, PinMapError> {
        self.pins
            .get(&logical_id)
            .copied()
            .ok_or(PinMapError::UnknownPin(logical_id))
    }

    pub fn layout(&self) -> BoardLayout {
        self.layout
    }

    pub fn numbering(&self) -> PinNumbering {
        self.numbering
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn orange_pi_board_numbers() {
        let mapper = PinMapper::new(BoardLayout::OrangePi, PinNumbering::Board);
        let plant_light = mapper.resolve(12).unwrap();
        assert_eq!(plant_light.label(), "PD14");
        assert_eq!(plant_light.line(), 110);
        assert_eq!(mapper.resolve(32).unwrap().line(), 200);
        assert_eq!(mapper.resolve(16).unwrap().label(), "PC4");
    }

    #[test]
    fn unknown_pins_fail() {
        let mapper = PinMapper::new(BoardLayout::OrangePi, PinNumbering::Board);
        // power and ground pins are not in the table
        assert_eq!(mapper.resolve(1), Err(PinMapError::UnknownPin(1)));
        assert_eq!(mapper.resolve(6), Err(PinMapError::UnknownPin(6)));
        assert_eq!(mapper.resolve(41), Err(PinMapError::UnknownPin(41)));
    }

    #[test]
    fn soc_numbering_uses_lines() {
        let mapper = PinMapper::new(BoardLayout::RaspberryPi, PinNumbering::Soc);
        assert_eq!(mapper.resolve(17).unwrap().label(), "GPIO17");
        assert!(mapper.resolve(40).is_err());
    }

    #[test]
    fn tables_have_unique_ids_and_lines() {
        for layout in [BoardLayout::OrangePi, BoardLayout::RaspberryPi] {
            let headers: HashSet<u32> = layout.table().iter().map(|(id, _)| *id).collect();
            let lines: HashSet<u32> = layout.table().iter().map(|(_, d)| d.line()).collect();
            assert_eq!(headers.len(), layout.table().len(), "{}", layout);
            assert_eq!(lines.len(), layout.table().len(), "{}", layout);
            assert_eq!(PinMapper::new(layout, PinNumbering::Board).pin_count(), 28);
        }
    }
}
