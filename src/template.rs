//! Message body templates with `{{.Field}}` placeholders.
//!
//! Templates are parsed once at startup against the list of fields their
//! context record provides, so rendering can never hit an unknown field.

use crate::config::ConfigError;
use crate::message::{AlarmContext, MessageContext};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;

pub const VITALS_TEMPLATE_FILE: &str = "VitalTemplate.txt";
pub const WAVEFORM_TEMPLATE_FILE: &str = "WaveFormTemplate.txt";
pub const ALARM_TEMPLATE_FILE: &str = "AlarmTemplate.txt";

const BUILTIN_VITALS: &str = include_str!("../templates/VitalTemplate.txt");
const BUILTIN_WAVEFORM: &str = include_str!("../templates/WaveFormTemplate.txt");
const BUILTIN_ALARM: &str = include_str!("../templates/AlarmTemplate.txt");

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const SEGMENT_TERMINATOR: char = '\r';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Vitals,
    Waveform,
    Alarm,
}

impl TemplateKind {
    pub fn name(self) -> &'static str {
        match self {
            TemplateKind::Vitals => "vitals",
            TemplateKind::Waveform => "waveform",
            TemplateKind::Alarm => "alarm",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            TemplateKind::Vitals => VITALS_TEMPLATE_FILE,
            TemplateKind::Waveform => WAVEFORM_TEMPLATE_FILE,
            TemplateKind::Alarm => ALARM_TEMPLATE_FILE,
        }
    }

    pub fn fields(self) -> &'static [&'static str] {
        match self {
            TemplateKind::Vitals | TemplateKind::Waveform => MessageContext::FIELDS,
            TemplateKind::Alarm => AlarmContext::FIELDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    kind: TemplateKind,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source`, normalizing line endings to HL7 segment terminators.
    pub fn parse(kind: TemplateKind, source: &str) -> Result<Self, ConfigError> {
        let source = normalize_line_endings(source);
        let syntax_error = |offset: usize, reason: String| ConfigError::TemplateSyntax {
            name: kind.name().to_string(),
            offset,
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = source.as_str();
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open
                .find(CLOSE)
                .ok_or_else(|| syntax_error(offset + start, "unclosed placeholder".to_string()))?;

            let action = after_open[..end].trim();
            let field = action.strip_prefix('.').ok_or_else(|| {
                syntax_error(offset + start, format!("expected .Field, found {action:?}"))
            })?;
            if !kind.fields().contains(&field) {
                return Err(syntax_error(offset + start, format!("unknown field {field:?}")));
            }
            segments.push(Segment::Field(field.to_string()));

            let consumed = start + OPEN.len() + end + CLOSE.len();
            rest = &rest[consumed..];
            offset += consumed;
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { kind, segments })
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    /// Fill placeholders from `context`'s serialized fields.
    pub fn render<C: Serialize>(&self, context: &C) -> String {
        let value = serde_json::to_value(context).unwrap_or(Value::Null);
        let mut out = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => match value.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {}
                    Some(other) => {
                        let _ = write!(out, "{other}");
                    }
                },
            }
        }

        out
    }
}

fn normalize_line_endings(source: &str) -> String {
    let trimmed = source.trim_end_matches(['\r', '\n']);
    trimmed
        .replace("\r\n", "\r")
        .replace('\n', &SEGMENT_TERMINATOR.to_string())
}

/// The three templates a bed renders from.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    pub vitals: Template,
    pub waveform: Template,
    pub alarm: Template,
}

impl TemplateSet {
    /// Templates compiled into the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        Ok(Self {
            vitals: Template::parse(TemplateKind::Vitals, BUILTIN_VITALS)?,
            waveform: Template::parse(TemplateKind::Waveform, BUILTIN_WAVEFORM)?,
            alarm: Template::parse(TemplateKind::Alarm, BUILTIN_ALARM)?,
        })
    }

    /// Load `VitalTemplate.txt`, `WaveFormTemplate.txt` and `AlarmTemplate.txt`
    /// from `dir`.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let load = |kind: TemplateKind| -> Result<Template, ConfigError> {
            let path = dir.join(kind.file_name());
            let source = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::TemplateIo { path, source })?;
            Template::parse(kind, &source)
        };

        Ok(Self {
            vitals: load(TemplateKind::Vitals)?,
            waveform: load(TemplateKind::Waveform)?,
            alarm: load(TemplateKind::Alarm)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BedId;

    fn sample_context() -> MessageContext {
        MessageContext {
            unit: "LABMR".into(),
            bed: "4".into(),
            patient_id: "4".into(),
            patient_last: "L4".into(),
            patient_first: "F4".into(),
            datetime: "20240101120000.0000+0000".into(),
            datetime_sub1: "20240101115959.0000+0000".into(),
        }
    }

    #[test]
    fn test_render_fills_placeholders() {
        let template =
            Template::parse(TemplateKind::Vitals, "PID|||{{.PatientID}}||{{ .PatientLast }}^{{.PatientFirst}}")
                .unwrap();
        assert_eq!(template.render(&sample_context()), "PID|||4||L4^F4");
    }

    #[test]
    fn test_line_endings_become_segment_terminators() {
        let template = Template::parse(TemplateKind::Vitals, "MSH|1\r\nPID|{{.Bed}}\nOBX|2\n").unwrap();
        assert_eq!(template.render(&sample_context()), "MSH|1\rPID|4\rOBX|2");
    }

    #[test]
    fn test_unclosed_placeholder_is_rejected() {
        let err = Template::parse(TemplateKind::Vitals, "MSH|{{.Unit").unwrap_err();
        assert!(matches!(err, ConfigError::TemplateSyntax { offset: 4, .. }));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = Template::parse(TemplateKind::Vitals, "{{.AlarmCode}}").unwrap_err();
        assert!(err.to_string().contains("AlarmCode"));
    }

    #[test]
    fn test_placeholder_without_dot_is_rejected() {
        assert!(Template::parse(TemplateKind::Alarm, "{{Unit}}").is_err());
    }

    #[test]
    fn test_builtin_templates_parse_and_render() {
        let set = TemplateSet::builtin().unwrap();
        let context = MessageContext::now(&BedId::from_index("LABMR", 12));
        let vitals = set.vitals.render(&context);
        assert!(vitals.starts_with("MSH|"));
        assert!(vitals.contains("L12^F12"));
        assert!(!vitals.contains('\n'));
        assert!(set.waveform.render(&context).contains(&context.datetime));
    }

    #[test]
    fn test_load_dir_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TemplateSet::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::TemplateIo { .. }));
    }

    #[test]
    fn test_load_dir_reads_all_three() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VITALS_TEMPLATE_FILE), "V|{{.Bed}}").unwrap();
        std::fs::write(dir.path().join(WAVEFORM_TEMPLATE_FILE), "W|{{.Bed}}").unwrap();
        std::fs::write(dir.path().join(ALARM_TEMPLATE_FILE), "A|{{.AlarmLevel}}").unwrap();

        let set = TemplateSet::load_dir(dir.path()).unwrap();
        assert_eq!(set.vitals.render(&sample_context()), "V|4");
        assert_eq!(set.waveform.render(&sample_context()), "W|4");
        assert_eq!(set.alarm.kind(), TemplateKind::Alarm);
    }
}
