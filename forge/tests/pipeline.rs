use std::{fs, path::Path};

use forge::{
    ForgeError,
    builder::{GraphBuilder, UnknownLayerPolicy},
    build_model,
    configs::{Layout, write_json},
    driver::{TrainRequest, run_training},
    onnx::{
        convert, convert_onnx_file,
        proto::{
            AttributeProto, Dimension, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
            TensorProto, TensorShapeProto, TensorTypeProto, TypeProto, ValueInfoProto, data_type,
        },
    },
    paths::ModelPaths,
    signature::IoNames,
    snapshot,
};
use ndarray::{ArrayD, IxDyn};
use prost::Message;
use serde_json::{Value, json};

fn write(path: &Path, value: &Value) {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).unwrap();
    }
    write_json(path, value, 2).unwrap();
}

fn classifier() -> Value {
    json!({
        "model_name": "classifier",
        "inputs": [
            {"name": "a", "shape": [-1, 2], "dtype": "float32"},
            {"name": "b", "shape": [-1, 2]}
        ],
        "outputs": [{"name": "probs"}, {"name": "hidden"}],
        "layers": [
            {"type": "Dense", "params": {"units": 4, "activation": "relu", "input_name": "a", "output_name": "hidden"}},
            {"type": "Dense", "params": {"units": 4, "input_name": "b", "output_name": "side"}},
            {"type": "Add", "params": {"input_names": ["hidden", "side"], "output_name": "sum"}},
            {"type": "Dense", "params": {"units": 2, "activation": "softmax", "input_name": "sum", "output_name": "probs"}}
        ]
    })
}

fn q_network() -> Value {
    json!({
        "model_name": "q",
        "inputs": [{"name": "state", "shape": [-1, 2]}],
        "outputs": [{"name": "q"}],
        "layers": [
            {"type": "Dense", "params": {"units": 6, "activation": "tanh", "input_name": "state", "output_name": "h"}},
            {"type": "Dense", "params": {"units": 1, "input_name": "h", "output_name": "q"}}
        ]
    })
}

fn read_io_names(snapshot: &Path) -> IoNames {
    let content = fs::read_to_string(snapshot.join(snapshot::IO_NAMES_FILE)).unwrap();
    serde_json::from_str(&content).unwrap()
}

fn builder() -> GraphBuilder {
    GraphBuilder::new().with_seed(Some(7))
}

#[test]
fn built_models_expose_their_io_names() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ModelPaths::new(tmp.path());
    write(&paths.description(), &classifier());

    let dir = build_model(tmp.path(), "1", &builder()).unwrap();
    assert_eq!(dir, paths.snapshot("1"));

    let names = read_io_names(&dir);
    assert_eq!(names.inputs.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(names.inputs["a"], "serving_default_a:0");
    assert_eq!(names.outputs["hidden"], "StatefulPartitionedCall:0");
    assert_eq!(names.outputs["probs"], "StatefulPartitionedCall:1");

    let loaded = snapshot::load(&dir).unwrap();
    assert_eq!(loaded.graph.output_names(), vec!["probs", "hidden"]);
}

#[test]
fn unknown_layers_follow_the_builder_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ModelPaths::new(tmp.path());
    let mut description = q_network();
    description["layers"].as_array_mut().unwrap().push(json!({
        "type": "LSTM",
        "params": {"units": 3, "input_name": "state", "output_name": "memory"}
    }));
    write(&paths.description(), &description);

    let err = build_model(tmp.path(), "1", &builder()).unwrap_err();
    assert!(matches!(err, ForgeError::UnsupportedLayer { index: 2, .. }));
    assert!(!paths.snapshot("1").exists());

    let skip = builder().with_policy(UnknownLayerPolicy::Skip);
    let dir = build_model(tmp.path(), "1", &skip).unwrap();
    assert_eq!(read_io_names(&dir).outputs.keys().collect::<Vec<_>>(), vec!["q"]);
}

#[test]
fn missing_files_are_reported_before_training() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ModelPaths::new(tmp.path());
    let request = TrainRequest {
        model_path: tmp.path().to_path_buf(),
        input_version: "1".into(),
        output_version: "2".into(),
        files: None,
        seed: Some(1),
    };

    let what = |err: ForgeError| match err {
        ForgeError::MissingFile { what, .. } => what,
        other => panic!("expected a missing file, got {other}"),
    };

    assert_eq!(
        what(run_training(&request).unwrap_err()),
        "Missing Model Description Json File."
    );

    write(&paths.description(), &q_network());
    assert_eq!(
        what(run_training(&request).unwrap_err()),
        "Missing Training Config Json File."
    );

    write(&paths.train_config(), &json!({"epochs": 1}));
    assert_eq!(
        what(run_training(&request).unwrap_err()),
        "Missing Training Data Json File."
    );
}

#[test]
fn supervised_training_saves_a_new_version() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ModelPaths::new(tmp.path());
    write(&paths.description(), &classifier());
    build_model(tmp.path(), "1", &builder()).unwrap();

    write(&paths.train_config(), &json!({"epochs": 3, "batch_size": 2}));
    write(
        &paths.supervised_data(),
        &json!({
            "inputs": {
                "a": [[0, 0], [0, 1], [1, 0], [1, 1]],
                "b": [[1, 1], [1, 0], [0, 1], [0, 0]]
            },
            "labels": {
                "probs": [[1, 0], [0, 1], [0, 1], [1, 0]],
                "hidden": [[0, 0, 0, 0], [0, 0, 0, 0], [0, 0, 0, 0], [0, 0, 0, 0]]
            }
        }),
    );

    let request = TrainRequest {
        model_path: tmp.path().to_path_buf(),
        input_version: "1".into(),
        output_version: "2".into(),
        files: None,
        seed: Some(3),
    };

    let summary = run_training(&request).unwrap();
    assert_eq!(summary.snapshot, paths.snapshot("2"));
    assert_eq!(summary.supervised.as_ref().map(|h| h.epochs()), Some(3));
    assert!(summary.reward.is_none());

    let before = snapshot::load(&paths.snapshot("1")).unwrap();
    let after = snapshot::load(&paths.snapshot("2")).unwrap();
    assert_ne!(before.graph.params(), after.graph.params());
    assert_eq!(read_io_names(&paths.snapshot("2")), read_io_names(&paths.snapshot("1")));

    // Versions are immutable
    let err = run_training(&request).unwrap_err();
    assert!(matches!(err, ForgeError::SnapshotExists(_)));
}

#[test]
fn explicit_reward_data_selects_reward_training() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ModelPaths::new(tmp.path().join("model"));
    write(&paths.description(), &q_network());
    build_model(paths.root(), "1", &builder()).unwrap();

    let config = tmp.path().join("config.json");
    let data = tmp.path().join("data.json");
    write(&config, &json!({"epochs": 5, "batch_size": 2, "learning_rate": 0.01}));
    write(
        &data,
        &json!([
            {"state": [0, 1], "action": 0, "reward": 1.0, "next_state": [1, 1]},
            {"state": [1, 1], "action": 1, "reward": -1.0, "done": true},
            {"state": [1, 0], "action": 0, "reward": 0.5, "done": 0}
        ]),
    );

    let summary = run_training(&TrainRequest {
        model_path: paths.root().to_path_buf(),
        input_version: "1".into(),
        output_version: "2".into(),
        files: Some((config, data)),
        seed: Some(9),
    })
    .unwrap();

    let report = summary.reward.unwrap();
    assert_eq!(report.samples, 3);
    assert!(report.epochs >= 1 && report.epochs <= 5);
    assert!(summary.supervised.is_none());
    assert!(paths.snapshot("2").join(snapshot::IO_NAMES_FILE).is_file());
}

#[test]
fn two_sample_reward_files_are_not_taken_for_supervised_data() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ModelPaths::new(tmp.path().join("model"));
    write(&paths.description(), &q_network());
    build_model(paths.root(), "1", &builder()).unwrap();

    let config = tmp.path().join("config.json");
    let data = tmp.path().join("data.json");
    write(&config, &json!({"epochs": 3, "batch_size": 2}));
    write(
        &data,
        &json!([
            {"state": [0, 1], "action": 1, "reward": 0.5, "done": true},
            {"state": [1, 1], "action": 0, "reward": 1.0, "next_state": [1, 0], "done": 0}
        ]),
    );

    let summary = run_training(&TrainRequest {
        model_path: paths.root().to_path_buf(),
        input_version: "1".into(),
        output_version: "2".into(),
        files: Some((config, data)),
        seed: Some(3),
    })
    .unwrap();

    assert!(summary.supervised.is_none());
    assert_eq!(summary.reward.unwrap().samples, 2);
    assert!(paths.snapshot("2").is_dir());
}

#[test]
fn reloaded_snapshots_predict_the_same() {
    let tmp = tempfile::tempdir().unwrap();
    let layout: Layout = serde_json::from_value(json!({
        "model_name": "cnn",
        "inputs": [{"name": "img", "shape": [-1, 6, 6, 1]}],
        "outputs": [{"name": "out"}],
        "layers": [
            {"type": "Conv2D", "params": {"filters": 3, "kernel_size": 3, "padding": "same", "activation": "relu", "input_name": "img", "output_name": "c1"}},
            {"type": "MaxPooling2D", "params": {"input_name": "c1", "output_name": "p1"}},
            {"type": "BatchNormalization", "params": {"input_name": "p1", "output_name": "bn"}},
            {"type": "Flatten", "params": {"input_name": "bn", "output_name": "flat"}},
            {"type": "Dropout", "params": {"rate": 0.5, "input_name": "flat", "output_name": "drop"}},
            {"type": "Dense", "params": {"units": 2, "activation": "sigmoid", "input_name": "drop", "output_name": "out"}}
        ]
    }))
    .unwrap();

    let mut graph = builder().build(&layout).unwrap();
    let dir = tmp.path().join("Saved_1");
    snapshot::save(&dir, &layout, &graph).unwrap();
    let mut loaded = snapshot::load(&dir).unwrap();

    let x = ArrayD::from_shape_fn(IxDyn(&[3, 6, 6, 1]), |ix| {
        ((ix[0] * 36 + ix[1] * 6 + ix[2]) % 7) as f32 / 7.
    });
    let expected = graph.predict(&[x.clone()], 2).unwrap();
    let got = loaded.graph.predict(&[x.clone()], 2).unwrap();
    assert_eq!(expected, got);

    let rebuilt = Layout::from_graph(&loaded.graph).unwrap();
    let kinds: Vec<&str> = rebuilt.layers.iter().map(|l| l.kind.as_str()).collect();
    let original: Vec<&str> = layout.layers.iter().map(|l| l.kind.as_str()).collect();
    assert_eq!(kinds, original);

    let mut again = builder().build(&rebuilt).unwrap();
    again.params_mut().copy_from_slice(loaded.graph.params());
    assert_eq!(again.predict(&[x], 2).unwrap(), expected);
}

fn onnx_mlp() -> ModelProto {
    let value = |name: &str, dims: &[i64]| ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            tensor_type: Some(TensorTypeProto {
                elem_type: data_type::FLOAT,
                shape: Some(TensorShapeProto {
                    dim: dims
                        .iter()
                        .map(|&d| Dimension {
                            dim_value: (d > 0).then_some(d),
                            dim_param: (d <= 0).then(|| "batch".to_string()),
                        })
                        .collect(),
                }),
            }),
        }),
    };

    let weights: Vec<f32> = vec![0.5, -1., 0.25, 1., 0.75, -0.5];
    let raw: Vec<u8> = weights.iter().flat_map(|w| w.to_le_bytes()).collect();

    ModelProto {
        ir_version: 8,
        producer_name: "pipeline".into(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
        graph: Some(GraphProto {
            name: "mlp".into(),
            node: vec![
                NodeProto {
                    input: vec!["x".into(), "W".into(), "B".into()],
                    output: vec!["z".into()],
                    name: "gemm".into(),
                    op_type: "Gemm".into(),
                    attribute: vec![AttributeProto {
                        name: "transB".into(),
                        i: 1,
                        r#type: 2,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                NodeProto {
                    input: vec!["z".into()],
                    output: vec!["y".into()],
                    name: "relu".into(),
                    op_type: "Relu".into(),
                    ..Default::default()
                },
            ],
            initializer: vec![
                TensorProto {
                    name: "W".into(),
                    dims: vec![2, 3],
                    data_type: data_type::FLOAT,
                    raw_data: raw,
                    ..Default::default()
                },
                TensorProto {
                    name: "B".into(),
                    dims: vec![2],
                    data_type: data_type::FLOAT,
                    float_data: vec![0.1, -0.1],
                    ..Default::default()
                },
            ],
            input: vec![value("x", &[0, 3])],
            output: vec![value("y", &[0, 2])],
            ..Default::default()
        }),
    }
}

#[test]
fn onnx_models_convert_to_snapshots() {
    let tmp = tempfile::tempdir().unwrap();
    let model = onnx_mlp();
    let onnx_path = tmp.path().join("mlp.onnx");
    fs::write(&onnx_path, model.encode_to_vec()).unwrap();

    let out = tmp.path().join("Saved_1");
    let names = convert_onnx_file(&onnx_path, &out).unwrap();
    assert_eq!(names.inputs["x"], "serving_default_x:0");
    assert_eq!(names.outputs["y"], "StatefulPartitionedCall:0");
    assert_eq!(read_io_names(&out), names);

    let x = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1., 2., 3., -2., 0., 1.]).unwrap();
    let mut loaded = snapshot::load(&out).unwrap();
    let y = loaded.graph.predict(&[x.clone()], 2).unwrap().remove(0);

    // relu(x @ W^T + B)
    let expected = [
        (0.5 - 2. + 0.75 + 0.1_f32).max(0.),
        (1. + 1.5 - 1.5 - 0.1_f32).max(0.),
        (-1. + 0. + 0.25 + 0.1_f32).max(0.),
        (-2. + 0. - 0.5 - 0.1_f32).max(0.),
    ];
    for (got, want) in y.iter().zip(expected) {
        assert!((got - want).abs() < 1e-5, "{got} != {want}");
    }

    let (_, mut converted) = convert(&model).unwrap();
    assert_eq!(converted.predict(&[x], 2).unwrap().remove(0), y);
}
