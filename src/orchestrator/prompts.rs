//! Per-phase prompt instructions and output schemas.

use crate::agent::OutputSchema;
use crate::phase::PhaseKind;

/// The output schema a phase expects back from the backend. Ingest and
/// export never call the backend; their schemas are empty placeholders kept
/// so the match stays exhaustive.
pub fn schema_for(phase: PhaseKind) -> OutputSchema {
    match phase {
        PhaseKind::Ingest => OutputSchema::new("source", &[]),
        PhaseKind::Context => OutputSchema::new("annotation", &[("note", true)]),
        PhaseKind::Pretranslation => OutputSchema::new("glossary", &[("terms", true)]),
        PhaseKind::Translate => OutputSchema::new("translation", &[("translation", true)]),
        PhaseKind::Qa => OutputSchema::new("qa", &[("issues", true)]),
        PhaseKind::Edit => OutputSchema::new("edit", &[("translation", true)]),
        PhaseKind::Export => OutputSchema::new("export", &[]),
    }
}

pub fn instructions_for(phase: PhaseKind, language: Option<&str>) -> String {
    let lang = language.unwrap_or("the target language");
    match phase {
        PhaseKind::Ingest | PhaseKind::Export => String::new(),
        PhaseKind::Context => "Annotate lines that contain idioms, cultural references, or \
             wordplay a translator must know about. Only return items for \
             lines that genuinely need a note; skip the rest."
            .to_string(),
        PhaseKind::Pretranslation => format!(
            "For each line, list recurring names and terms with their \
             canonical translation into {lang}. Return a \"terms\" array \
             per line (it may be empty)."
        ),
        PhaseKind::Translate => format!(
            "Translate each line into {lang}. Respect the glossary and any \
             per-line context notes. Keep speaker voice consistent."
        ),
        PhaseKind::Qa => format!(
            "Review each translated line ({lang}) against its source. Return \
             an \"issues\" array per line describing mistranslations, \
             dropped content, or tone breaks; an empty array means the line \
             is fine."
        ),
        PhaseKind::Edit => format!(
            "Polish each translated line ({lang}), fixing the listed QA \
             issues while staying faithful to the source. Return the final \
             \"translation\" for every line, edited or not."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_phases_have_required_fields() {
        for phase in PhaseKind::ALL {
            let schema = schema_for(phase);
            if phase.uses_backend() {
                assert!(
                    schema.fields.iter().any(|f| f.required),
                    "{phase} schema must require at least one field"
                );
                assert!(!instructions_for(phase, Some("de")).is_empty());
            }
        }
    }

    #[test]
    fn test_language_is_interpolated() {
        let text = instructions_for(PhaseKind::Translate, Some("de"));
        assert!(text.contains("de"));
    }
}
