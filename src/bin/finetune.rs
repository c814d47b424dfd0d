use std::{path::PathBuf, str::FromStr};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use clap::Parser;
use tokenizers::Tokenizer;

use bert_finetune::{masked_accuracy, LearnerError, LmDataBunch, LmLearner, ModelType, RunConfig};

fn main() {
    if let Err(err) = run() {
        eprintln!("fine-tuning failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Masked-LM fine-tuning CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to run config file")]
    config: PathBuf,

    #[arg(long, help = "Skip saving the fine-tuned model at the end of the run")]
    no_save: bool,
}

fn run() -> Result<(), LearnerError> {
    let args = Args::parse();
    let config = RunConfig::from_path(&args.config)?;

    let device = select_device();
    let model_type = ModelType::from_str(&config.model_type)
        .map_err(|err| LearnerError::initialization(err.to_string()))?;

    let tokenizer = Tokenizer::from_file(&config.tokenizer_json).map_err(|err| {
        LearnerError::initialization(format!(
            "failed to load tokenizer {}: {err}",
            config.tokenizer_json.display()
        ))
    })?;

    let bunch = LmDataBunch::from_text_files(
        &config.train_files,
        &config.validation_files,
        tokenizer,
        model_type,
        config.sequence_length,
        config.train_batch_size,
        config.val_batch_size,
        config.mask_probability,
    )?;

    let mut learner = LmLearner::from_pretrained(
        bunch,
        &config.pretrained_path,
        &config.output_dir,
        vec![masked_accuracy()],
        device,
        config.options.clone(),
        None,
    )?;

    let outcome = learner.fit(&config.fit)?;
    println!(
        "training finished: {} optimizer steps, mean loss {:.4}",
        outcome.total_steps, outcome.mean_loss
    );

    if !args.no_save {
        let path = learner.save_model(None)?;
        println!("model saved to {}", path.display());
    }

    Ok(())
}

fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(err) => eprintln!("metal reported available but initialization failed: {err}"),
        }
    }
    if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(err) => eprintln!("cuda reported available but initialization failed: {err}"),
        }
    }
    Device::Cpu
}
