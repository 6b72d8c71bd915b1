use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct VoiceInfo {
    pub name: &'static str,
    pub characteristic: &'static str,
    pub gender: &'static str,
}

const fn voice(name: &'static str, characteristic: &'static str, gender: &'static str) -> VoiceInfo {
    VoiceInfo {
        name,
        characteristic,
        gender,
    }
}

/// Gemini prebuilt voices.
pub const CATALOGUE: &[VoiceInfo] = &[
    voice("Zephyr", "Bright", "female"),
    voice("Puck", "Upbeat", "male"),
    voice("Charon", "Informative", "male"),
    voice("Kore", "Firm", "female"),
    voice("Fenrir", "Excitable", "male"),
    voice("Leda", "Youthful", "female"),
    voice("Orus", "Firm", "male"),
    voice("Aoede", "Breezy", "female"),
    voice("Callirrhoe", "Easy-going", "female"),
    voice("Autonoe", "Bright", "female"),
    voice("Enceladus", "Breathy", "male"),
    voice("Iapetus", "Clear", "male"),
    voice("Umbriel", "Easy-going", "male"),
    voice("Algieba", "Smooth", "male"),
    voice("Despina", "Smooth", "female"),
    voice("Erinome", "Clear", "female"),
    voice("Algenib", "Gravelly", "male"),
    voice("Rasalgethi", "Informative", "male"),
    voice("Laomedeia", "Upbeat", "female"),
    voice("Achernar", "Soft", "female"),
    voice("Alnilam", "Firm", "male"),
    voice("Schedar", "Even", "male"),
    voice("Gacrux", "Mature", "female"),
    voice("Pulcherrima", "Forward", "female"),
    voice("Achird", "Friendly", "male"),
    voice("Zubenelgenubi", "Casual", "male"),
    voice("Vindemiatrix", "Gentle", "female"),
    voice("Sadachbia", "Lively", "male"),
    voice("Sadaltager", "Knowledgeable", "male"),
    voice("Sulafat", "Warm", "female"),
];

const ROLE_DEFAULTS: &[(&str, &str)] = &[
    ("Provider", "Charon"),
    ("Doctor", "Charon"),
    ("Nurse", "Sulafat"),
    ("Patient", "Achernar"),
    ("Speaker A", "Kore"),
    ("Speaker B", "Puck"),
    ("Speaker C", "Fenrir"),
    ("Speaker D", "Leda"),
];

/// Alternates gender and timbre so neighbouring speakers sound distinct.
const ROTATION: &[&str] = &[
    "Kore", "Charon", "Sulafat", "Puck", "Aoede", "Achird", "Gacrux", "Iapetus", "Leda", "Fenrir",
];

pub fn voice_info(name: &str) -> Option<&'static VoiceInfo> {
    CATALOGUE.iter().find(|v| v.name == name)
}

/// Speaker -> voice table. Assignment is deterministic given the order of calls.
#[derive(Debug, Default, Clone)]
pub struct VoiceManager {
    assignments: HashMap<String, String>,
    used: HashSet<String>,
}

impl VoiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_voice(&mut self, speaker: &str, explicit: Option<&str>) -> String {
        if let Some(v) = self.assignments.get(speaker) {
            return v.clone();
        }

        if let Some(v) = explicit {
            return self.record(speaker, v);
        }

        if let Some((_, default)) = ROLE_DEFAULTS.iter().find(|(role, _)| *role == speaker) {
            if !self.used.contains(*default) {
                return self.record(speaker, default);
            }
        }

        let unused = ROTATION
            .iter()
            .copied()
            .chain(CATALOGUE.iter().map(|v| v.name))
            .find(|v| !self.used.contains(*v));

        match unused {
            Some(v) => self.record(speaker, v),
            None => {
                // Every voice is taken: share the first rotation voice.
                let fallback = ROTATION[0].to_string();
                self.assignments.insert(speaker.to_string(), fallback.clone());
                fallback
            }
        }
    }

    /// Returns the speaker's voice, assigning one on first use.
    pub fn get_voice(&mut self, speaker: &str) -> String {
        self.assign_voice(speaker, None)
    }

    /// Manual overrides replace any existing assignment.
    pub fn set_manual_assignments<'a, I>(&mut self, assignments: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (speaker, voice) in assignments {
            self.assignments.insert(speaker.clone(), voice.clone());
            self.used.insert(voice.clone());
        }
    }

    pub fn assignments(&self) -> BTreeMap<String, String> {
        self.assignments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn record(&mut self, speaker: &str, voice: &str) -> String {
        self.assignments.insert(speaker.to_string(), voice.to_string());
        self.used.insert(voice.to_string());
        voice.to_string()
    }
}

/// Parses `"Speaker A:Kore,Provider:Charon"`. Malformed pairs are ignored.
pub fn parse_voice_mapping(s: &str) -> HashMap<String, String> {
    s.split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(speaker, voice)| (speaker.trim().to_string(), voice.trim().to_string()))
        .filter(|(speaker, voice)| !speaker.is_empty() && !voice.is_empty())
        .collect()
}
