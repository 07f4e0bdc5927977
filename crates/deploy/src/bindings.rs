//! Client binding generation from contract ABIs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;

/// Consumes ABI descriptors and produces typed client bindings.
pub trait BindingGenerator: Send + Sync {
    /// Generate bindings for `contract`, returning the files written.
    fn generate(&self, contract: &str, abi: &Value) -> anyhow::Result<Vec<PathBuf>>;
}

/// Writes `<out_dir>/<Contract>.json` plus a Rust module that feeds it to alloy's `sol!`.
#[derive(Debug, Clone)]
pub struct AbiExporter {
    out_dir: PathBuf,
}

impl AbiExporter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

impl BindingGenerator for AbiExporter {
    fn generate(&self, contract: &str, abi: &Value) -> anyhow::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.out_dir).with_context(|| {
            format!(
                "Failed to create bindings directory {}",
                self.out_dir.display()
            )
        })?;

        let abi_path = self.out_dir.join(format!("{contract}.json"));
        let content = serde_json::to_string_pretty(abi).context("Failed to serialize ABI")?;
        std::fs::write(&abi_path, content)
            .with_context(|| format!("Failed to write {}", abi_path.display()))?;

        let module_path = self.out_dir.join(format!("{}.rs", module_name(contract)));
        let module = format!(
            "// Generated by slipway. Do not edit.\n\
             alloy::sol!(\n    #[sol(rpc)]\n    {contract},\n    \"{}\"\n);\n",
            abi_path.display()
        );
        std::fs::write(&module_path, module)
            .with_context(|| format!("Failed to write {}", module_path.display()))?;

        tracing::debug!(contract, out_dir = %self.out_dir.display(), "Generated bindings");

        Ok(vec![abi_path, module_path])
    }
}

/// `MyToken` -> `my_token`.
fn module_name(contract: &str) -> String {
    let mut name = String::with_capacity(contract.len() + 4);
    for (i, c) in contract.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                name.push('_');
            }
            name.push(c.to_ascii_lowercase());
        } else {
            name.push(c);
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("Token"), "token");
        assert_eq!(module_name("MyToken"), "my_token");
    }

    #[test]
    fn test_exporter_writes_abi_and_module() {
        let dir = TempDir::new("slipway-bindings").expect("Failed to create temp dir");
        let exporter = AbiExporter::new(dir.path().join("typechain"));

        let abi = serde_json::json!([{"type": "function", "name": "totalSupply", "inputs": [], "outputs": []}]);
        let written = exporter.generate("Token", &abi).expect("bindings");

        assert_eq!(written.len(), 2);
        let exported: Value =
            serde_json::from_str(&std::fs::read_to_string(&written[0]).unwrap()).unwrap();
        assert_eq!(exported, abi);

        let module = std::fs::read_to_string(&written[1]).unwrap();
        assert!(module.contains("alloy::sol!"));
        assert!(module.contains("Token"));
    }
}
