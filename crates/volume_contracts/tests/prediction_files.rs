use volume_contracts::{
    prediction_path, read_predictions, write_predictions, AnnotationSet, BoxZyx, ContractError,
    Detection, LesionAnnotation, VolumeAnnotation, PREDICTION_TEMPLATE,
};

#[test]
fn predictions_overwrite_previous_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = prediction_path(tmp.path(), PREDICTION_TEMPLATE, "vol_001");
    assert!(path.ends_with("vol_001.json"));

    let first = vec![
        Detection::new(BoxZyx::new([4.0; 3], [2.0; 3]), 0.9, 0, 0.8),
        Detection::new(BoxZyx::new([9.0; 3], [3.0; 3]), 0.5, 0, 1.0),
    ];
    write_predictions(&path, &first).unwrap();
    assert_eq!(read_predictions(&path).unwrap().len(), 2);

    let second = vec![Detection::new(BoxZyx::new([1.0; 3], [1.0; 3]), 0.2, 0, 1.0)];
    write_predictions(&path, &second).unwrap();
    let loaded = read_predictions(&path).unwrap();
    assert_eq!(loaded.len(), 1);
    assert!((loaded[0].score - 0.2).abs() < 1e-6);
}

#[test]
fn out_of_range_score_rejected_on_read() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("bad.json");
    let mut det = Detection::new(BoxZyx::new([4.0; 3], [2.0; 3]), 0.9, 0, 0.8);
    det.score = 1.5;
    write_predictions(&path, &[det]).unwrap();
    let err = read_predictions(&path).unwrap_err();
    assert!(matches!(err, ContractError::InvalidScore(_)));
}

#[test]
fn annotation_set_round_trips_through_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let set = AnnotationSet {
        volumes: vec![VolumeAnnotation {
            id: "case_7".into(),
            volume: "case_7.raw".into(),
            shape: [16, 32, 32],
            spacing_mm: [0.5, 0.2, 0.2],
            fold: Some(2),
            lesions: vec![LesionAnnotation {
                bbox: BoxZyx::from_corners([2.0, 4.0, 4.0], [10.0, 20.0, 24.0]),
                class_id: 0,
            }],
        }],
    };
    let path = tmp.path().join("annotations.json");
    set.save(&path).unwrap();
    let loaded = AnnotationSet::load_root(tmp.path()).unwrap();
    let vol = loaded.get("case_7").unwrap();
    assert_eq!(vol.shape, [16, 32, 32]);
    assert_eq!(vol.lesions.len(), 1);
    assert_eq!(vol.volume_path(tmp.path()), tmp.path().join("case_7.raw"));
}
