//! ConfigId documents survive serialization for any printable names.

use daq_fleet::device::ConfigId;
use proptest::prelude::*;

proptest! {
    #[test]
    fn config_id_xml_roundtrip(
        describe in "[ -~]{0,20}",
        prepare in "[ -~]{0,20}",
        configure in "[ -~]{0,20}",
    ) {
        let original = ConfigId::new(describe, prepare, configure);
        let xml = original.to_xml().unwrap();
        prop_assert_eq!(ConfigId::from_xml(&xml).unwrap(), original);
    }

    #[test]
    fn config_id_file_names_follow_steps(name in "[a-z0-9_]{1,12}") {
        let config = ConfigId::new(name.clone(), name.clone(), name.clone());
        let [describe, prepare, configure] = config.file_names();
        prop_assert_eq!(describe, format!("describe-{name}.xcfg"));
        prop_assert_eq!(prepare, format!("prepare-{name}.xcfg"));
        prop_assert_eq!(configure, format!("configure-{name}.xcfg"));
    }
}
