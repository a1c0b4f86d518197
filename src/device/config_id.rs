//! Configuration set identifiers and their ECC XML form.
//!
//! ```xml
//! <ConfigId>
//!   <SubConfigId type="describe">cobo</SubConfigId>
//!   <SubConfigId type="prepare">base</SubConfigId>
//!   <SubConfigId type="configure">beam</SubConfigId>
//! </ConfigId>
//! ```

use crate::error::{AppResult, DaqError};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use serde::{Deserialize, Serialize};
use std::fmt;

const ROOT: &str = "ConfigId";
const SUB: &str = "SubConfigId";

/// Names of the describe/prepare/configure files applied by each transition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId {
    /// Used by the Describe step
    pub describe: String,
    /// Used by the Prepare step
    pub prepare: String,
    /// Used by the Configure step
    pub configure: String,
}

#[derive(Clone, Copy)]
enum Step {
    Describe,
    Prepare,
    Configure,
}

impl Step {
    fn from_attr(value: &str) -> AppResult<Self> {
        match value {
            "describe" => Ok(Step::Describe),
            "prepare" => Ok(Step::Prepare),
            "configure" => Ok(Step::Configure),
            other => Err(DaqError::Xml(format!("unknown SubConfigId type '{other}'"))),
        }
    }

    fn parse(elem: &BytesStart<'_>) -> AppResult<Self> {
        let attr = elem
            .try_get_attribute("type")
            .map_err(DaqError::xml)?
            .ok_or_else(|| DaqError::Xml("SubConfigId without a type attribute".to_string()))?;
        let value = attr.unescape_value().map_err(DaqError::xml)?;
        Self::from_attr(&value)
    }
}

impl ConfigId {
    /// Build from the three step names.
    pub fn new(
        describe: impl Into<String>,
        prepare: impl Into<String>,
        configure: impl Into<String>,
    ) -> Self {
        Self {
            describe: describe.into(),
            prepare: prepare.into(),
            configure: configure.into(),
        }
    }

    fn slot(&mut self, step: Step) -> &mut String {
        match step {
            Step::Describe => &mut self.describe,
            Step::Prepare => &mut self.prepare,
            Step::Configure => &mut self.configure,
        }
    }

    /// File names as they appear in a device's config directory.
    pub fn file_names(&self) -> [String; 3] {
        [
            format!("describe-{}.xcfg", self.describe),
            format!("prepare-{}.xcfg", self.prepare),
            format!("configure-{}.xcfg", self.configure),
        ]
    }

    /// Serialize to the XML document the device controller expects.
    pub fn to_xml(&self) -> AppResult<String> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Start(BytesStart::new(ROOT)))
            .map_err(DaqError::xml)?;
        for (kind, name) in [
            ("describe", &self.describe),
            ("prepare", &self.prepare),
            ("configure", &self.configure),
        ] {
            let mut elem = BytesStart::new(SUB);
            elem.push_attribute(("type", kind));
            writer.write_event(Event::Start(elem)).map_err(DaqError::xml)?;
            writer
                .write_event(Event::Text(BytesText::new(name)))
                .map_err(DaqError::xml)?;
            writer
                .write_event(Event::End(BytesEnd::new(SUB)))
                .map_err(DaqError::xml)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(ROOT)))
            .map_err(DaqError::xml)?;
        String::from_utf8(writer.into_inner()).map_err(DaqError::xml)
    }

    /// Parse a `ConfigId` document. Missing steps come back as empty names.
    pub fn from_xml(xml: &str) -> AppResult<Self> {
        let mut reader = Reader::from_str(xml);
        let mut config = ConfigId::default();
        let mut saw_root = false;
        let mut current: Option<Step> = None;
        let mut text = String::new();

        loop {
            match reader.read_event().map_err(DaqError::xml)? {
                Event::Start(elem) if !saw_root => {
                    check_root(elem.name().as_ref())?;
                    saw_root = true;
                }
                Event::Empty(elem) if !saw_root => {
                    check_root(elem.name().as_ref())?;
                    saw_root = true;
                }
                Event::Start(elem) if elem.name().as_ref() == SUB.as_bytes() => {
                    current = Some(Step::parse(&elem)?);
                    text.clear();
                }
                Event::Empty(elem) if elem.name().as_ref() == SUB.as_bytes() => {
                    config.slot(Step::parse(&elem)?).clear();
                }
                Event::Text(chunk) if current.is_some() => {
                    text.push_str(&chunk.unescape().map_err(DaqError::xml)?);
                }
                Event::End(elem) if elem.name().as_ref() == SUB.as_bytes() => {
                    if let Some(step) = current.take() {
                        *config.slot(step) = std::mem::take(&mut text);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_root {
            return Err(DaqError::Xml("document has no ConfigId element".to_string()));
        }
        Ok(config)
    }
}

fn check_root(name: &[u8]) -> AppResult<()> {
    if name == ROOT.as_bytes() {
        Ok(())
    } else {
        Err(DaqError::Xml(format!(
            "expected root element ConfigId, found '{}'",
            String::from_utf8_lossy(name)
        )))
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.describe, self.prepare, self.configure)
    }
}
