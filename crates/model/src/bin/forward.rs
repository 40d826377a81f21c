use std::{path::PathBuf, str::FromStr};

use candle_core::{DType, Device, Tensor, D};
use clap::{Parser, ValueEnum};
use serde_json::{Number, Value};

use model::{DeviceContext, Model, ModelConfig, ModelError, ModelHyperparameters, PortableConfig};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("forward failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a pico model on a prompt with cached greedy decoding", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Model config (.json or .toml); defaults to the built-in configuration"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration field, e.g. n_layers=2"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        value_name = "IDS",
        default_value = "1,2,3,4",
        help = "Comma-separated prompt token ids"
    )]
    prompt: PromptArg,

    #[arg(long, default_value_t = 8, help = "Number of tokens to decode after the prompt")]
    steps: usize,

    #[arg(long, value_enum, default_value_t = Precision::F32, help = "Parameter storage dtype")]
    dtype: Precision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Precision {
    F32,
    Bf16,
    F16,
}

impl From<Precision> for DType {
    fn from(value: Precision) -> Self {
        match value {
            Precision::F32 => DType::F32,
            Precision::Bf16 => DType::BF16,
            Precision::F16 => DType::F16,
        }
    }
}

#[derive(Debug, Clone)]
struct OverrideArg {
    key: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if key.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct PromptArg(Vec<u32>);

impl FromStr for PromptArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|err| format!("invalid token id '{}': {err}", part.trim()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Err("prompt must contain at least one token id".into());
        }
        Ok(Self(ids))
    }
}

fn run() -> Result<(), ModelError> {
    let args = Args::parse();

    let base = match &args.config {
        Some(path) => ModelConfig::from_path(path)?,
        None => ModelConfig::default(),
    };
    let mut portable = PortableConfig::from_model_config(&base);
    for override_arg in &args.overrides {
        portable.set(&override_arg.key, parse_override_value(&override_arg.value))?;
    }
    portable.validate()?;
    if !portable.extra.is_empty() {
        log::warn!(
            "unknown config keys ignored: {:?}",
            portable.extra.keys().collect::<Vec<_>>()
        );
    }

    let context = DeviceContext::new(Device::Cpu, args.dtype.into());
    let model = Model::with_context(&portable.to_model_config(), &context)?;
    let max_seq_len = model.config().max_seq_len;

    let prompt = &args.prompt.0;
    let ids = Tensor::new(prompt.as_slice(), &context.device)?.unsqueeze(0)?;
    let (logits, mut cache) = model.forward(&ids, None, true)?;
    println!("prefill logits shape: {:?}", logits.dims());

    let mut generated = Vec::with_capacity(args.steps);
    let mut next = greedy_next(&logits)?;
    for _ in 0..args.steps {
        let position = cache.as_ref().map_or(0, |c| c.seq_len());
        if position >= max_seq_len {
            log::warn!("stopping at max_seq_len {max_seq_len}");
            break;
        }
        generated.push(next);
        let step_ids = Tensor::new(&[[next]], &context.device)?;
        let (step_logits, step_cache) = model.forward(&step_ids, cache.as_ref(), true)?;
        cache = step_cache;
        next = greedy_next(&step_logits)?;
    }

    println!("prompt:    {:?}", prompt);
    println!("generated: {:?}", generated);
    if let Some(cache) = &cache {
        println!("cache: {} layers x {} positions", cache.len(), cache.seq_len());
    }
    Ok(())
}

/// Argmax over the vocabulary at the last position of the first sequence.
fn greedy_next(logits: &Tensor) -> Result<u32, ModelError> {
    let (_, seq_len, _) = logits.dims3()?;
    let last = logits.narrow(1, seq_len - 1, 1)?.argmax(D::Minus1)?;
    let ids = last.flatten_all()?.to_vec1::<u32>()?;
    ids.first().copied().ok_or_else(|| {
        ModelError::Precondition("forward returned logits for an empty batch".to_string())
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int_val) = trimmed.parse::<u64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}
