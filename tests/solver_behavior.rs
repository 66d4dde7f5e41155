use std::collections::HashMap;

use candle_core::{Device, Tensor};
use cebra::solver::checkpoint::{FORMAT, VERSION};
use cebra::{
    CebraError, Conditional, Dataset, FitOutcome, MultiSessionDataset, MultiSessionSolver, Phase,
    SingleSessionSolver, Solver, SolverConfig, TemperatureMode, TensorDataset,
};

fn config() -> SolverConfig {
    SolverConfig {
        model: "offset1-model-v2".to_string(),
        batch_size: 32,
        conditional: Conditional::Time,
        time_offset: 2,
        device: "cpu".to_string(),
        log_interval: 0,
        ..SolverConfig::default()
    }
}

fn dataset(n: usize, c: usize, phase: f32) -> TensorDataset {
    let values = (0..n * c)
        .map(|i| {
            let t = (i / c) as f32;
            let ch = (i % c) as f32;
            (t * 0.1 + ch * 0.7 + phase).sin()
        })
        .collect();
    TensorDataset::from_vec(values, n, c, &Device::Cpu).unwrap()
}

fn with_position(data: TensorDataset) -> TensorDataset {
    let n = data.len();
    let labels = (0..n).map(|i| (i as f32 / n as f32 * 6.0).sin()).collect();
    data.with_continuous(labels, 1).unwrap()
}

fn rows(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_vec2::<f32>().unwrap()
}

fn assert_close(a: &[Vec<f32>], b: &[Vec<f32>]) {
    assert_eq!(a.len(), b.len());
    for (ra, rb) in a.iter().zip(b) {
        for (x, y) in ra.iter().zip(rb) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }
}

#[test]
fn time_contrastive_fit_records_every_step() {
    let data = dataset(100, 4, 0.0);
    let mut solver = SingleSessionSolver::new(config()).unwrap();
    let outcome = solver.fit(&data, 10).unwrap();
    assert_eq!(outcome, FitOutcome::Completed { step: 10 });

    let history = solver.history();
    assert_eq!(history.len(), 10);
    for (i, record) in history.records().iter().enumerate() {
        assert_eq!(record.step, i + 1);
        assert!(record.loss.is_finite());
        assert!(record.loss >= 0.0);
        assert_eq!(record.temperature, Some(1.0));
    }

    let embedding = solver.transform(&data).unwrap();
    assert_eq!(embedding.dims(), &[99, 8]);
    for row in rows(&embedding) {
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}

#[test]
fn too_short_recording_fails_before_training() {
    let data = dataset(5, 3, 0.0);
    let mut solver = SingleSessionSolver::new(SolverConfig {
        model: "offset10-model".to_string(),
        ..config()
    })
    .unwrap();
    let err = solver.fit(&data, 3).unwrap_err();
    assert!(matches!(err, CebraError::InsufficientSamples { .. }), "{err}");
    assert_eq!(solver.step(), 0);
    assert!(solver.history().is_empty());
}

#[test]
fn same_seed_same_run() {
    let data = with_position(dataset(80, 3, 0.0));
    let cfg = SolverConfig {
        conditional: Conditional::TimeDelta,
        seed: 7,
        ..config()
    };
    let mut a = SingleSessionSolver::new(cfg.clone()).unwrap();
    let mut b = SingleSessionSolver::new(cfg).unwrap();
    a.fit(&data, 5).unwrap();
    b.fit(&data, 5).unwrap();
    assert_eq!(a.history().losses(), b.history().losses());
    assert_eq!(
        rows(&a.transform(&data).unwrap()),
        rows(&b.transform(&data).unwrap())
    );
}

#[test]
fn resumed_training_matches_uninterrupted_training() {
    let data = dataset(100, 4, 0.0);
    let cfg = SolverConfig {
        temperature_mode: TemperatureMode::Auto,
        ..config()
    };

    let mut straight = SingleSessionSolver::new(cfg.clone()).unwrap();
    straight.fit(&data, 10).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("half.safetensors");
    let mut first = SingleSessionSolver::new(cfg.clone()).unwrap();
    first.fit(&data, 5).unwrap();
    first.save(&path).unwrap();

    let mut resumed = SingleSessionSolver::new(cfg).unwrap();
    resumed.load(&path).unwrap();
    assert_eq!(resumed.step(), 5);
    assert!(resumed.history().is_empty());
    resumed.fit(&data, 5).unwrap();

    assert_eq!(resumed.step(), 10);
    let expected: Vec<f32> = straight.history().losses()[5..].to_vec();
    let actual = resumed.history().losses();
    for (x, y) in expected.iter().zip(&actual) {
        assert!((x - y).abs() < 1e-4, "{x} != {y}");
    }
    assert!(resumed.history().last().unwrap().temperature.is_some());
    assert_close(
        &rows(&straight.transform(&data).unwrap()),
        &rows(&resumed.transform(&data).unwrap()),
    );
}

#[test]
fn exploding_scores_halt_with_non_finite_loss() {
    let data = dataset(60, 3, 0.0);
    let mut solver = SingleSessionSolver::new(SolverConfig {
        temperature: 1e-39,
        ..config()
    })
    .unwrap();
    match solver.fit(&data, 5) {
        Err(CebraError::NonFinite {
            quantity,
            step,
            last_valid_step,
        }) => {
            assert_eq!(quantity, "loss");
            assert_eq!(step, 1);
            assert_eq!(last_valid_step, 0);
        }
        other => panic!("expected a non-finite loss, got {other:?}"),
    }
    assert_eq!(solver.step(), 0);
    assert!(solver.history().is_empty());
    assert_eq!(solver.phase(), Phase::Stopped);
}

#[test]
fn stop_request_writes_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let data = dataset(60, 3, 0.0);
    let mut solver = SingleSessionSolver::new(SolverConfig {
        output_dir: Some(dir.path().to_path_buf()),
        ..config()
    })
    .unwrap();
    solver.fit(&data, 2).unwrap();

    let handle = solver.stop_handle();
    handle.stop();
    let outcome = solver.fit(&data, 10).unwrap();
    assert_eq!(outcome, FitOutcome::Interrupted { step: 2 });
    assert_eq!(solver.phase(), Phase::Stopped);
    assert!(dir.path().join("checkpoint.safetensors").exists());

    handle.reset();
    assert_eq!(
        solver.fit(&data, 1).unwrap(),
        FitOutcome::Completed { step: 3 }
    );
}

#[test]
fn periodic_checkpoints_land_in_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let data = dataset(60, 3, 0.0);
    let mut solver = SingleSessionSolver::new(SolverConfig {
        output_dir: Some(dir.path().to_path_buf()),
        checkpoint_interval: 2,
        ..config()
    })
    .unwrap();
    solver.fit(&data, 5).unwrap();
    assert!(dir.path().join("checkpoint_2.safetensors").exists());
    assert!(dir.path().join("checkpoint_4.safetensors").exists());
    assert!(!dir.path().join("checkpoint_5.safetensors").exists());

    let mut restored = SingleSessionSolver::new(config()).unwrap();
    restored
        .load(&dir.path().join("checkpoint_4.safetensors"))
        .unwrap();
    assert_eq!(restored.step(), 4);
}

#[test]
fn failed_checkpoint_write_stops_the_solver() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    let data = dataset(60, 3, 0.0);
    let mut solver = SingleSessionSolver::new(SolverConfig {
        output_dir: Some(blocker),
        checkpoint_interval: 1,
        ..config()
    })
    .unwrap();
    assert!(solver.fit(&data, 3).is_err());
    assert_eq!(solver.phase(), Phase::Stopped);
    assert_eq!(solver.step(), 1);
    assert_eq!(solver.history().len(), 1);
    assert_eq!(solver.transform(&data).unwrap().dims(), &[59, 8]);
}

#[test]
fn newer_checkpoint_version_is_rejected_and_solver_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.safetensors");
    let data = dataset(60, 3, 0.0);

    let mut solver = SingleSessionSolver::new(config()).unwrap();
    solver.fit(&data, 2).unwrap();
    solver.save(&path).unwrap();

    // Rewrite the archive with a bumped version.
    let bytes = std::fs::read(&path).unwrap();
    let (_, header) = safetensors::SafeTensors::read_metadata(&bytes).unwrap();
    let mut metadata = header.metadata().clone().unwrap();
    assert_eq!(metadata["format"], FORMAT);
    assert_eq!(metadata["version"], VERSION);
    metadata.insert("version".to_string(), "2".to_string());
    let tensors = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
    let entries: Vec<(&String, &Tensor)> = tensors.iter().collect();
    safetensors::serialize_to_file(entries, &Some(metadata), &path).unwrap();

    let before = rows(&solver.transform(&data).unwrap());
    match solver.load(&path) {
        Err(CebraError::IncompatibleCheckpoint { found, .. }) => assert_eq!(found, "2"),
        other => panic!("expected a version error, got {other:?}"),
    }
    assert_eq!(solver.step(), 2);
    assert_eq!(rows(&solver.transform(&data).unwrap()), before);
}

#[test]
fn multi_session_sessions_of_different_width() {
    let sessions = vec![
        with_position(dataset(70, 6, 0.0)),
        with_position(dataset(90, 9, 1.3)),
    ];
    let data = MultiSessionDataset::new(sessions).unwrap();
    let mut solver = MultiSessionSolver::new(SolverConfig {
        conditional: Conditional::Delta,
        batch_size: 16,
        ..config()
    })
    .unwrap();
    solver.fit(&data, 4).unwrap();
    assert_eq!(solver.history().len(), 4);
    assert!(solver.history().losses().iter().all(|l| l.is_finite()));

    let embeddings = solver.transform(&data).unwrap();
    assert_eq!(embeddings.len(), 2);
    assert_eq!(embeddings[0].dims(), &[69, 8]);
    assert_eq!(embeddings[1].dims(), &[89, 8]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.safetensors");
    solver.save(&path).unwrap();
    let mut restored = MultiSessionSolver::new(config()).unwrap();
    restored.load(&path).unwrap();
    assert_eq!(restored.num_sessions(), Some(2));
    assert_eq!(
        rows(&restored.transform_session(&data, 1).unwrap()),
        rows(&embeddings[1])
    );
}

#[test]
fn multi_session_requires_shared_label_schema() {
    let sessions = vec![with_position(dataset(40, 3, 0.0)), dataset(40, 3, 0.0)];
    assert!(matches!(
        MultiSessionDataset::new(sessions),
        Err(CebraError::InvalidData(_))
    ));
}

#[test]
fn discrete_conditional_trains_on_labels() {
    let labels: Vec<u32> = (0..80).map(|i| (i / 20) as u32).collect();
    let data = dataset(80, 3, 0.0).with_discrete(labels).unwrap();
    let mut solver =
        SingleSessionSolver::with_conditional(config(), Conditional::Discrete).unwrap();
    solver.fit(&data, 3).unwrap();
    assert_eq!(solver.history().len(), 3);

    let unlabeled = dataset(80, 3, 0.0);
    let mut fresh = SingleSessionSolver::with_conditional(config(), Conditional::Discrete).unwrap();
    assert!(matches!(
        fresh.fit(&unlabeled, 1),
        Err(CebraError::InvalidConfig(_))
    ));
}

#[test]
fn saved_embeddings_are_readable() {
    let dir = tempfile::tempdir().unwrap();
    let data = dataset(40, 3, 0.0);
    let mut solver = SingleSessionSolver::new(config()).unwrap();
    solver.fit(&data, 1).unwrap();
    let embedding = solver.transform(&data as &dyn Dataset).unwrap();
    let mut tensors = HashMap::new();
    tensors.insert("embedding".to_string(), embedding);
    let path = dir.path().join("embedding.safetensors");
    cebra::data::save_tensors(&tensors, &path).unwrap();
    let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
    assert_eq!(loaded["embedding"].dims(), &[39, 8]);
}
