use layerwise::{
    Activation, Checkpoint, Dataset, EngineError, LayerConfig, LossKind, Model, Sample,
    TrainingOptions,
};

fn trained_model() -> Model {
    let mut model = Model::with_seed(3, 21);
    model
        .add_layer(LayerConfig::dense(3, 6, Activation::Swish))
        .unwrap()
        .add_layer(LayerConfig::layer_norm(6))
        .unwrap()
        .add_layer(LayerConfig::attention(6, 3))
        .unwrap()
        .add_layer(LayerConfig::dense(6, 2, Activation::None).without_bias())
        .unwrap()
        .add_layer(LayerConfig::softmax(2))
        .unwrap();

    let samples = (0..12)
        .map(|i| {
            let x = i as f32 / 12.0;
            let target = if i % 2 == 0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
            Sample::new(vec![x, 1.0 - x, x * x], target)
        })
        .collect();
    let options = TrainingOptions {
        epochs: 10,
        batch_size: 4,
        loss: LossKind::CrossEntropy,
        positional_encoding: true,
        ..TrainingOptions::default()
    };
    model.train(&Dataset::split(samples, 0.25), &options).unwrap();
    model
}

#[test]
fn test_save_load_round_trip() {
    let model = trained_model();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.lwck");

    model.save(&path).unwrap();
    let loaded = Model::load(&path).unwrap();

    assert_eq!(loaded.layers(), model.layers());
    assert_eq!(loaded.snapshot(), model.snapshot());
    assert_eq!(loaded.optimizer(), model.optimizer());
    assert_eq!(loaded.seed(), model.seed());
    assert_eq!(loaded.positional_encoding(), model.positional_encoding());
    assert_eq!(loaded.last_summary(), model.last_summary());

    for input in [[0.0, 0.5, 1.0], [0.3, -0.2, 0.9]] {
        let expected = model.predict(&input).unwrap();
        let actual = loaded.predict(&input).unwrap();
        let same_bits = expected
            .iter()
            .zip(&actual)
            .all(|(a, b)| a.to_bits() == b.to_bits());
        assert!(same_bits, "{:?} != {:?}", expected, actual);
    }
}

#[test]
fn test_loaded_model_keeps_training() {
    let model = trained_model();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.lwck");
    model.save(&path).unwrap();

    let mut loaded = Model::load(&path).unwrap();
    let step = loaded.optimizer().t;
    let data = Dataset::new(vec![Sample::new(vec![0.1, 0.2, 0.3], vec![1.0, 0.0])]);
    let options = TrainingOptions {
        epochs: 2,
        batch_size: 1,
        loss: LossKind::CrossEntropy,
        ..TrainingOptions::default()
    };
    loaded.train(&data, &options).unwrap();
    assert_eq!(loaded.optimizer().t, step + 2);
}

#[test]
fn test_load_errors() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing.lwck");
    assert!(matches!(Model::load(&missing), Err(EngineError::Io(_))));

    let garbage = dir.path().join("garbage.lwck");
    std::fs::write(&garbage, b"not a checkpoint at all").unwrap();
    assert!(matches!(
        Model::load(&garbage),
        Err(EngineError::Checkpoint(_))
    ));

    let bytes = Checkpoint::from_model(&trained_model()).to_bytes().unwrap();
    let truncated = dir.path().join("truncated.lwck");
    std::fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();
    assert!(Model::load(&truncated).is_err());
}
