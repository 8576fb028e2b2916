//! Pre-built target profiles (§4.3). These are value-level conveniences, not
//! core protocol behavior — a caller is always free to build a `TargetConfig`
//! by hand instead.

use crate::space::{
    ChecksumKind, ExcludeRange, LoadFilter, PhaseTimeouts, ProductCode, SpaceConfig, SpaceKind,
    TargetConfig,
};

fn default_timeouts() -> PhaseTimeouts {
    PhaseTimeouts {
        enquire_ms: 500,
        select_ms: 1_000,
        erase_ms: 5_000,
        data_ms: 1_000,
        verify_ms: 2_000,
        finish_ms: 1_000,
    }
}

fn simple_flash_space(name: &'static str, hex_block: usize) -> SpaceConfig {
    SpaceConfig {
        name,
        kind: SpaceKind::Simple,
        checksum: ChecksumKind::Fill,
        hex_block,
        send_block: hex_block,
        addressing: 1,
        data_offset: 0,
        skip_empty_blocks: true,
        load_filter: LoadFilter::Identity,
        select_delay_ms: None,
    }
}

/// PIC18 main controller: a single program-flash space, simple framing, with
/// the low bootblock (config/bootloader code at 0x0000-0x0BFF) excluded from
/// application programming so a re-bootload never overwrites the bootloader
/// that's running it.
pub fn pic18_controller() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Code(0x01),
        product_type: 0x01,
        supports_passthru: false,
        timeouts: default_timeouts(),
        enquire_retries: 3,
        data_retries: 3,
        spaces: vec![SpaceConfig {
            load_filter: LoadFilter::ExcludeRanges(vec![exclude_bootblock(0x0BFF)]),
            ..simple_flash_space("program", 64)
        }],
    }
}

/// CS1451 sensor module.
pub fn cs1451() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Code(0x02),
        product_type: 0x02,
        supports_passthru: false,
        timeouts: default_timeouts(),
        enquire_retries: 3,
        data_retries: 3,
        spaces: vec![simple_flash_space("program", 64)],
    }
}

/// CS1814 Bluetooth adapter, reached through a PASSTHRU-capable controller.
pub fn cs1814_bt() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Code(0x03),
        product_type: 0x03,
        supports_passthru: true,
        timeouts: default_timeouts(),
        enquire_retries: 3,
        data_retries: 3,
        spaces: vec![simple_flash_space("program", 64)],
    }
}

/// CS1435 HMI panel: application space uses the HMI/PIC24 send-filter and a
/// hardcoded zero checksum because hexmate balances it offline (spec §9 Open
/// Questions — preserved, flagged, not second-guessed here).
pub fn cs1435_hmi() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Code(0x04),
        product_type: 0x04,
        supports_passthru: false,
        timeouts: default_timeouts(),
        enquire_retries: 3,
        data_retries: 3,
        spaces: vec![SpaceConfig {
            name: "application",
            kind: SpaceKind::HmiPic24,
            checksum: ChecksumKind::Zero,
            hex_block: 256,
            send_block: 192,
            addressing: 1,
            data_offset: 0,
            skip_empty_blocks: true,
            load_filter: LoadFilter::Identity,
            select_delay_ms: Some(250),
        }],
    }
}

/// PIC24 application space: HMI-style framing, two addresses per three
/// physical bytes, NoFill checksum.
pub fn pic24_app() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Any,
        product_type: 0x05,
        supports_passthru: false,
        timeouts: default_timeouts(),
        enquire_retries: 3,
        data_retries: 3,
        spaces: vec![SpaceConfig {
            name: "application",
            kind: SpaceKind::HmiPic24,
            checksum: ChecksumKind::NoFill,
            hex_block: 256,
            send_block: 192,
            addressing: 2,
            data_offset: 0,
            skip_empty_blocks: true,
            load_filter: LoadFilter::Identity,
            select_delay_ms: None,
        }],
    }
}

/// PIC18 EEPROM space, relocated from its 0xF00000 HEX-file base down to a
/// zero-based device address.
pub fn pic18_eeprom() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Any,
        product_type: 0x01,
        supports_passthru: false,
        timeouts: default_timeouts(),
        enquire_retries: 3,
        data_retries: 3,
        spaces: vec![SpaceConfig {
            name: "eeprom",
            kind: SpaceKind::Simple,
            checksum: ChecksumKind::Fill,
            hex_block: 16,
            send_block: 16,
            addressing: 1,
            data_offset: -0x00F0_0000,
            skip_empty_blocks: false,
            load_filter: LoadFilter::Identity,
            select_delay_ms: None,
        }],
    }
}

/// W25-series external SPI flash.
pub fn w25_spi_flash() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Any,
        product_type: 0x06,
        supports_passthru: false,
        timeouts: PhaseTimeouts {
            erase_ms: 20_000,
            ..default_timeouts()
        },
        enquire_retries: 3,
        data_retries: 5,
        spaces: vec![simple_flash_space("spi_flash", 256)],
    }
}

/// PIC16 tiny bootloader: small blocks, NoFill checksum (unused cells read
/// back as 0xFF naturally and must not be counted).
pub fn pic16_tiny_bl() -> TargetConfig {
    TargetConfig {
        product_code: ProductCode::Any,
        product_type: 0x07,
        supports_passthru: false,
        timeouts: default_timeouts(),
        enquire_retries: 3,
        data_retries: 3,
        spaces: vec![SpaceConfig {
            name: "program",
            kind: SpaceKind::Simple,
            checksum: ChecksumKind::NoFill,
            hex_block: 32,
            send_block: 32,
            addressing: 1,
            data_offset: 0,
            skip_empty_blocks: true,
            load_filter: LoadFilter::Identity,
            select_delay_ms: None,
        }],
    }
}

/// A bootloader config space (0x0000-0x0BFF on many PIC18s) frequently
/// excluded from application programming.
pub fn exclude_bootblock(end: u32) -> ExcludeRange {
    ExcludeRange {
        start: 0,
        end,
        exclude: true,
    }
}

/// Looks a profile up by name, for front ends that take the target as a
/// command-line argument rather than linking in a specific constructor.
pub fn lookup(name: &str) -> Option<TargetConfig> {
    Some(match name {
        "pic18_controller" => pic18_controller(),
        "cs1451" => cs1451(),
        "cs1814_bt" => cs1814_bt(),
        "cs1435_hmi" => cs1435_hmi(),
        "pic24_app" => pic24_app(),
        "pic18_eeprom" => pic18_eeprom(),
        "w25_spi_flash" => w25_spi_flash(),
        "pic16_tiny_bl" => pic16_tiny_bl(),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_profile_has_at_least_one_space() {
        let profiles: Vec<TargetConfig> = vec![
            pic18_controller(),
            cs1451(),
            cs1814_bt(),
            cs1435_hmi(),
            pic24_app(),
            pic18_eeprom(),
            w25_spi_flash(),
            pic16_tiny_bl(),
        ];
        for profile in profiles {
            assert!(!profile.spaces.is_empty());
        }
    }

    #[test]
    fn hmi_profile_uses_zero_checksum() {
        let profile = cs1435_hmi();
        assert_eq!(profile.spaces[0].checksum, ChecksumKind::Zero);
    }

    #[test]
    fn pic18_controller_excludes_bootblock() {
        let profile = pic18_controller();
        match &profile.spaces[0].load_filter {
            LoadFilter::ExcludeRanges(ranges) => {
                assert_eq!(ranges.len(), 1);
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges[0].end, 0x0BFF);
                assert!(ranges[0].exclude);
            }
            LoadFilter::Identity => panic!("expected an exclusion range"),
        }
    }

    #[test]
    fn eeprom_profile_relocates_down_from_hex_base() {
        let profile = pic18_eeprom();
        assert_eq!(profile.spaces[0].data_offset, -0x00F0_0000);
    }

    #[test]
    fn lookup_finds_known_profiles_and_rejects_unknown() {
        assert!(lookup("w25_spi_flash").is_some());
        assert!(lookup("no_such_target").is_none());
    }
}
