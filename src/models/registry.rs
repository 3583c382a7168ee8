use crate::models::descriptor::ModelDescriptor;

/// A curated chat model known to work well locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommendedModel {
    pub id: &'static str,
    pub size_mb: u64,
    pub parameters: &'static str,
    pub description: &'static str,
    pub recommended: bool,
}

/// Built-in shortlist shown before the catalog has been queried
pub const MODELS: &[RecommendedModel] = &[
    RecommendedModel {
        id: "mlx-community/Qwen2.5-0.5B-Instruct-4bit",
        size_mb: 278,
        parameters: "0.5B",
        description: "Fastest, fine for short answers",
        recommended: false,
    },
    RecommendedModel {
        id: "mlx-community/Llama-3.2-1B-Instruct-4bit",
        size_mb: 695,
        parameters: "1B",
        description: "Balanced for most use cases",
        recommended: true,
    },
    RecommendedModel {
        id: "mlx-community/Llama-3.2-3B-Instruct-4bit",
        size_mb: 1820,
        parameters: "3B",
        description: "Better answers, slower",
        recommended: false,
    },
    RecommendedModel {
        id: "mlx-community/Mistral-7B-Instruct-v0.3-4bit",
        size_mb: 4080,
        parameters: "7B",
        description: "High quality, needs 8 GB of memory",
        recommended: false,
    },
];

impl RecommendedModel {
    /// Find model by identifier
    #[must_use]
    pub fn find(id: &str) -> Option<&'static Self> {
        MODELS.iter().find(|m| m.id == id)
    }

    /// Get all identifiers
    #[must_use]
    pub fn all_ids() -> Vec<&'static str> {
        MODELS.iter().map(|m| m.id).collect()
    }

    /// Get recommended model
    #[must_use]
    pub fn recommended() -> &'static Self {
        MODELS.iter().find(|m| m.recommended).unwrap_or(&MODELS[0])
    }

    /// Short name after the organization prefix
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        self.id.rsplit('/').next().unwrap_or(self.id)
    }

    /// Find closest identifier using Levenshtein distance on the short name
    #[must_use]
    pub fn suggest(name: &str) -> Option<&'static str> {
        if name.is_empty() {
            return None;
        }

        let needle = name.rsplit('/').next().unwrap_or(name).to_lowercase();

        MODELS
            .iter()
            .map(|m| (m.id, levenshtein_distance(&needle, &m.short_name().to_lowercase())))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(id, _)| id)
    }

    #[must_use]
    pub fn to_descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            size_bytes: Some(self.size_mb * 1_000_000),
            ..ModelDescriptor::from_id(self.id)
        }
    }
}

/// Edit distance between two model names, keeping one row of the table at a time
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut current = Vec::with_capacity(b.len() + 1);
        current.push(i + 1);
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current.push(substitution.min(previous[j + 1] + 1).min(current[j] + 1));
        }
        previous = current;
    }

    previous[b.len()]
}
