use anyhow::{bail, Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use flarecnn::cli::{
    parse_args, setup_logging, AppConfig, Commands, DownloadArgs, EvaluateArgs, PredictArgs, TrainArgs,
};
use flarecnn::data::loader::LightCurveLoader;
use flarecnn::data::plot::plot_examples;
use flarecnn::data::preprocessing::load_dataset;
use flarecnn::data::LightCurve;
use flarecnn::evaluate::{evaluate_model, plot_confusion_matrix};
use flarecnn::model::checkpoint::{load_metadata, load_model};
use flarecnn::predict::Predictor;
use flarecnn::remote::mast::{LightCurveQuery, MastClient};
use flarecnn::remote::{Downloader, RemoteConfig};
use flarecnn::training::trainer::Trainer;
use flarecnn::{DefaultBackend, TrainBackend};
use std::path::PathBuf;
use tracing::{error, info};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", flarecnn::info());

    let result = AppConfig::resolve(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Download(args) => run_download(args, config),
        Commands::Train(args) => run_train(args, config),
        Commands::Evaluate(args) => run_evaluate(args, config),
        Commands::Predict(args) => run_predict(args, config),
    });

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_download(args: DownloadArgs, config: AppConfig) -> Result<()> {
    let downloader = Downloader::new(&config.remote)?;

    let root = downloader
        .fetch_and_extract(&config.remote.dataset_url, &args.output)
        .context("Failed to download the training set")?;
    info!("Training set unpacked to {:?}", root);

    if args.pretrained {
        let model = downloader
            .fetch_model(&config.remote.pretrained_model_url)
            .context("Failed to download the pretrained model")?;
        info!("Pretrained model saved to {:?}", model);
    }

    Ok(())
}

fn run_train(args: TrainArgs, mut config: AppConfig) -> Result<()> {
    config.apply_train_args(&args);
    info!("Output directory: {:?}", args.output);
    flarecnn::utils::ensure_dir(&args.output)?;

    let root = dataset_root(args.data, &config.remote)?;
    let dataset = load_dataset(&root, &config.dataset)
        .with_context(|| format!("Failed to build examples from {:?}", root))?;
    dataset.summary().print();

    plot_examples(&args.output.join("examples.svg"), &dataset.train, 4)?;

    let device = NdArrayDevice::default();
    let mut trainer = Trainer::<TrainBackend>::new(config.training.clone(), config.model.clone(), device)?
        .with_checkpoint_dir(args.output.join("checkpoints"))?;

    info!("Starting model training...");
    let result = trainer.train(&dataset).context("Training failed")?;

    info!("=== Training Results ===");
    info!("Total epochs: {}", result.state.epoch);
    info!("Best validation accuracy: {:.4}", result.state.best_metric);
    info!("Training time: {}", flarecnn::utils::format_duration(result.duration_secs));
    if let Some(ref checkpoint) = result.best_checkpoint {
        info!("Best model saved to: {:?}", checkpoint);
    }

    let model_path = trainer.save(args.output.join("flare_cnn.mpk"))?;
    info!("Final model saved to: {:?}", model_path);

    if dataset.test.is_empty() {
        bail!("Test split is empty; nothing to evaluate");
    }
    let model = trainer.inference_model();
    let evaluation = evaluate_model(&model, &dataset.test, config.training.batch_size, &device)?;
    log_metrics("Test", &evaluation.metrics);

    let matrix = plot_confusion_matrix(
        &model,
        &dataset.test.data,
        &dataset.test.labels,
        &args.output.join("confusion_matrix.svg"),
        &device,
    )?;
    info!("Confusion matrix (rows = true class): {:?}", matrix.normalized());

    Ok(())
}

fn run_evaluate(args: EvaluateArgs, config: AppConfig) -> Result<()> {
    let model_path = resolve_model(args.model, &config.remote)?;

    // Windows must be cut at the length the model was trained on
    let metadata = load_metadata(&model_path)?;
    metadata.check_window_length(config.dataset.cadences)?;

    let root = dataset_root(args.data, &config.remote)?;
    let dataset = load_dataset(&root, &config.dataset)?;
    if dataset.test.is_empty() {
        bail!("Test split is empty; nothing to evaluate");
    }

    let device = NdArrayDevice::default();
    let (model, _) = load_model::<DefaultBackend, _>(&model_path, &device)
        .with_context(|| format!("Failed to load model from {:?}", model_path))?;

    info!("Evaluating on {} test examples", dataset.test.len());
    let evaluation = evaluate_model(&model, &dataset.test, args.batch_size, &device)?;
    log_metrics("Test", &evaluation.metrics);

    let matrix = plot_confusion_matrix(&model, &dataset.test.data, &dataset.test.labels, &args.plot, &device)?;

    if let Some(output) = args.output {
        let report = serde_json::json!({
            "model": model_path,
            "trained_epochs": metadata.epoch,
            "metrics": evaluation.metrics,
            "counts": matrix.counts,
            "normalized": matrix.normalized(),
        });
        std::fs::write(&output, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report {:?}", output))?;
        info!("Evaluation report saved to: {:?}", output);
    }

    Ok(())
}

fn run_predict(args: PredictArgs, config: AppConfig) -> Result<()> {
    let model_path = resolve_model(args.model.clone(), &config.remote)?;

    let device = NdArrayDevice::default();
    let predictor = Predictor::<DefaultBackend>::from_checkpoint(&model_path, device)
        .with_context(|| format!("Failed to load model from {:?}", model_path))?
        .with_batch_size(args.batch_size)
        .with_threshold(args.threshold);

    let light_curves = collect_light_curves(&args, &config.remote)?;
    if light_curves.is_empty() {
        bail!("No light curves to predict on");
    }

    let predictions = predictor.predict_many(&light_curves).context("Prediction failed")?;
    predictions.summary.print();

    for candidate in &predictions.candidates {
        info!(
            "TIC {} flare at {:.5} (p = {:.3}, {} cadences)",
            candidate.tic, candidate.peak_time, candidate.peak_probability, candidate.cadences
        );
    }

    predictions.write_to_dir(&args.output)?;
    info!("Predictions saved to: {:?}", args.output);

    Ok(())
}

/// Local light curves when `--input` is given, MAST downloads otherwise
fn collect_light_curves(args: &PredictArgs, remote: &RemoteConfig) -> Result<Vec<LightCurve>> {
    if let Some(input) = &args.input {
        let loader = LightCurveLoader::new();
        return if input.is_dir() {
            loader.load_dir(input)
        } else {
            Ok(vec![loader.load(input)?])
        };
    }

    if args.tic.is_empty() {
        bail!("Give at least one --tic or an --input path");
    }

    let downloader = Downloader::new(remote)?;
    let client = MastClient::new(&downloader, &remote.mast_url);
    let mut curves = Vec::new();
    for &tic in &args.tic {
        let mut query = LightCurveQuery::new(tic);
        if let Some(sector) = args.sector {
            query = query.with_sector(sector);
        }
        curves.extend(
            client
                .fetch_light_curves(&query)
                .with_context(|| format!("Failed to fetch light curves for TIC {}", tic))?,
        );
    }
    Ok(curves)
}

fn dataset_root(data: Option<PathBuf>, remote: &RemoteConfig) -> Result<PathBuf> {
    match data {
        Some(dir) => Ok(dir),
        None => {
            let dest = remote.cache_dir.join("dataset");
            Downloader::new(remote)?.fetch_and_extract(&remote.dataset_url, &dest)
        }
    }
}

fn resolve_model(model: Option<PathBuf>, remote: &RemoteConfig) -> Result<PathBuf> {
    match model {
        Some(path) if path.exists() => Ok(path),
        Some(path) => bail!("Model file {:?} does not exist", path),
        None => {
            info!("No model given, using the pretrained model");
            Downloader::new(remote)?.fetch_model(&remote.pretrained_model_url)
        }
    }
}

fn log_metrics(split: &str, metrics: &flarecnn::Metrics) {
    info!("{} metrics:", split);
    info!("  Loss: {:.4}", metrics.loss);
    info!("  Accuracy: {:.4}", metrics.accuracy);
    info!("  Precision: {:.4}", metrics.precision);
    info!("  Recall: {:.4}", metrics.recall);
    info!("  F1: {:.4}", metrics.f1);
}
