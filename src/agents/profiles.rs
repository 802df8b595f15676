use serde::{Deserialize, Serialize};

/// Static description of an agent kind: what it is told, what it may touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub kind: String,
    pub description: String,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    /// Name of the registered backend that serves this kind.
    pub backend: String,
}

struct Preset {
    kind: &'static str,
    description: &'static str,
    system_prompt: &'static str,
    allowed_tools: &'static [&'static str],
    max_turns: u32,
}

const PRESETS: &[Preset] = &[
    Preset {
        kind: "researcher",
        description: "Researches and synthesizes information from various sources",
        system_prompt: "You are a research specialist. Gather, synthesize, and present \
            information in a clear, structured manner. Verify facts and attribute sources.",
        allowed_tools: &["search_web", "write_md", "read_files"],
        max_turns: 8,
    },
    Preset {
        kind: "coder",
        description: "Builds software solutions and writes scripts",
        system_prompt: "You are a senior software developer. Write clean, documented, \
            efficient code with proper error handling.",
        allowed_tools: &["write_md", "write_file", "read_files", "list_directory"],
        max_turns: 6,
    },
    Preset {
        kind: "writer",
        description: "Creates and edits documents and content",
        system_prompt: "You are a professional writer. Create clear, well-structured content \
            adapted to the target audience.",
        allowed_tools: &["write_md", "read_files"],
        max_turns: 6,
    },
    Preset {
        kind: "analyst",
        description: "Performs data analysis and trend identification",
        system_prompt: "You are a data analyst. Identify patterns and trends and back every \
            insight with evidence.",
        allowed_tools: &["search_web", "write_md", "read_files", "analyze_data"],
        max_turns: 7,
    },
    Preset {
        kind: "designer",
        description: "Designs architectures and system plans",
        system_prompt: "You are a system architect. Produce scalable, maintainable designs \
            with clear documentation.",
        allowed_tools: &["write_md", "create_diagram", "read_files"],
        max_turns: 5,
    },
    Preset {
        kind: "qa_tester",
        description: "Validates and tests deliverables",
        system_prompt: "You are a quality assurance specialist. Test and verify deliverables \
            and report issues in detail.",
        allowed_tools: &["write_md", "test_code", "read_files", "validate_output"],
        max_turns: 5,
    },
];

/// Built-in agent kinds, all bound to `backend`.
pub fn default_profiles(backend: &str) -> Vec<AgentProfile> {
    PRESETS
        .iter()
        .map(|p| AgentProfile {
            kind: p.kind.to_string(),
            description: p.description.to_string(),
            system_prompt: p.system_prompt.to_string(),
            allowed_tools: p.allowed_tools.iter().map(|t| t.to_string()).collect(),
            max_turns: p.max_turns,
            backend: backend.to_string(),
        })
        .collect()
}
