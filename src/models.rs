pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDef {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: &'static str,
}

pub fn all_models() -> &'static [ModelDef] {
    &[
        ModelDef {
            id: "gpt-4o",
            name: "GPT-4o",
            provider: "OpenAI",
        },
        ModelDef {
            id: "gpt-4o-mini",
            name: "GPT-4o Mini",
            provider: "OpenAI",
        },
        ModelDef {
            id: "gpt-3.5-turbo",
            name: "GPT-3.5 Turbo",
            provider: "OpenAI",
        },
    ]
}

pub fn find_model(id: &str) -> Option<&'static ModelDef> {
    all_models().iter().find(|m| m.id == id)
}
