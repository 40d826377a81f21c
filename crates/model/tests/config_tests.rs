use std::fs;

use anyhow::Result;
use model::{ModelConfig, ModelError};
use tempfile::tempdir;

#[test]
fn loads_json_with_defaults_for_missing_fields() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pico.json");
    fs::write(&path, r#"{ "d_model": 64, "attention_n_heads": 4, "attention_n_kv_heads": 2 }"#)?;

    let config = ModelConfig::from_path(&path)?;
    assert_eq!(config.d_model, 64);
    assert_eq!(config.attention_n_heads, 4);
    assert_eq!(config.attention_n_kv_heads, 2);
    assert_eq!(config.vocab_size, ModelConfig::default().vocab_size);
    Ok(())
}

#[test]
fn loads_toml() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pico.toml");
    fs::write(
        &path,
        "d_model = 32\nn_layers = 2\nattention_n_heads = 4\nattention_n_kv_heads = 1\nnorm_eps = 1e-5\n",
    )?;

    let config = ModelConfig::from_path(&path)?;
    assert_eq!(config.n_layers, 2);
    assert_eq!(config.norm_eps, 1e-5);
    Ok(())
}

#[test]
fn rejects_unsupported_extension() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pico.yaml");
    fs::write(&path, "d_model: 8")?;

    assert!(matches!(
        ModelConfig::from_path(&path).unwrap_err(),
        ModelError::ConfigFormat(_)
    ));
    Ok(())
}

#[test]
fn invalid_file_contents_fail_validation() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pico.json");
    fs::write(&path, r#"{ "d_model": 30, "attention_n_heads": 4 }"#)?;

    assert!(matches!(
        ModelConfig::from_path(&path).unwrap_err(),
        ModelError::InvalidConfig(_)
    ));
    Ok(())
}

#[test]
fn json_file_floats_load_exactly() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pico.json");
    let expected = ModelConfig {
        d_model: 16,
        attention_n_heads: 2,
        attention_n_kv_heads: 1,
        norm_eps: 2.2107487544768887e-7,
        position_emb_theta: 123_456.78901234567,
        ..ModelConfig::default()
    };
    fs::write(&path, serde_json::to_string(&expected)?)?;

    let config = ModelConfig::from_path(&path)?;
    assert_eq!(config.norm_eps.to_bits(), expected.norm_eps.to_bits());
    assert_eq!(config, expected);
    Ok(())
}
