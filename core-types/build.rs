use minijinja::{Environment, context};
use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};

/// Host buffers are stored as 32-bit words, so every element type must be 4 bytes wide.
const WORD_TYPES: &[&str] = &["f32", "i32", "u32"];

#[derive(Debug, Deserialize, Serialize)]
struct TypeInfo {
    name: String,
    rust: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct TypeList {
    types: Vec<TypeInfo>,
}

fn main() {
    let yaml_path = Path::new("../supported_types.yaml");
    let yaml_str = fs::read_to_string(yaml_path)
        .expect("Unable to read supported_types.yaml");
    let type_list: TypeList = serde_yaml::from_str(&yaml_str)
        .expect("Failed to parse supported_types.yaml");

    for t in &type_list.types {
        assert!(
            WORD_TYPES.contains(&t.rust.as_str()),
            "element type `{}` ({}) is not a 32-bit word type",
            t.name,
            t.rust
        );
    }

    let template_path = Path::new("templates/data_types.jinja");
    let template_source = fs::read_to_string(template_path)
        .expect("Unable to read template file");

    let env = Environment::new();
    let tmpl = env.template_from_str(&template_source)
        .expect("Invalid data type template");

    let rendered = tmpl.render(context! { types => type_list.types })
        .expect("Failed to render data type template");

    // skip the write when nothing changed
    let out_path = Path::new("src/generated_data_types.rs");
    let unchanged = fs::read_to_string(out_path)
        .map(|existing| existing.trim_end() == rendered.trim_end())
        .unwrap_or(false);
    if !unchanged {
        fs::write(out_path, rendered).expect("Unable to write generated file");
    }

    println!("cargo:rerun-if-changed=../supported_types.yaml");
    println!("cargo:rerun-if-changed=templates/data_types.jinja");
}
