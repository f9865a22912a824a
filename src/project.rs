// src/project.rs

//! Project persistence: the mixer layout (channels + master) as JSON.
//! File dialogs and shell integration live outside the core; this module
//! only turns `ProjectSettings` into bytes and back.

use crate::types::ProjectSettings;
use anyhow::Result;
use std::path::Path;

pub fn load_project(data: &str) -> Result<ProjectSettings> {
    Ok(serde_json::from_str(data)?)
}

pub fn save_project(project: &ProjectSettings) -> Result<String> {
    Ok(serde_json::to_string_pretty(project)?)
}

pub fn load_project_file(path: &Path) -> Result<ProjectSettings> {
    let json = std::fs::read_to_string(path)?;
    load_project(&json)
}

pub fn save_project_file(path: &Path, project: &ProjectSettings) -> Result<()> {
    let mut project = project.clone();
    project.modified_at = chrono::Utc::now();
    std::fs::write(path, save_project(&project)?)?;
    println!("Project saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioChannel, Effect, EffectKind};

    #[test]
    fn project_json_round_trip() {
        let mut project = ProjectSettings::default();
        project.name = "Session A".to_string();
        let mut channel = AudioChannel::new("chan-9", "Guitar");
        channel.gain = 0.42;
        channel
            .effects
            .effects
            .push(Effect::new("verb-1", EffectKind::Reverb));
        project.channels.push(channel);

        let json = save_project(&project).unwrap();
        let loaded = load_project(&json).unwrap();
        assert_eq!(loaded.name, "Session A");
        let guitar = loaded.channels.iter().find(|c| c.id == "chan-9").unwrap();
        assert_eq!(guitar.gain, 0.42);
        assert_eq!(guitar.effects.effects[0].kind, EffectKind::Reverb);
    }

    #[test]
    fn malformed_project_data_is_an_error() {
        assert!(load_project("not json").is_err());
        assert!(load_project("{\"sample_rate\": \"wat\"}").is_err());
    }
}
