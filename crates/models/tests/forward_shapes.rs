use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use models::{Yolo3d, Yolo3dConfig, ANCHORS_PER_SCALE, STRIDES};

type B = NdArray<f32>;

#[test]
fn heads_match_strides_and_anchor_layout() {
    let device = Default::default();
    let cfg = Yolo3dConfig {
        base_channels: 2,
        num_classes: 2,
        ..Default::default()
    };
    let model = Yolo3d::<B>::new(&cfg, &device);
    let input = Tensor::<B, 5>::zeros([1, 1, 32, 64, 64], &device);
    let outputs = model.forward(input);

    for (out, stride) in outputs.iter().zip(STRIDES) {
        let expected = [
            1,
            32 / stride,
            64 / stride,
            64 / stride,
            ANCHORS_PER_SCALE,
            cfg.features_per_anchor(),
        ];
        assert_eq!(out.stride, stride);
        assert_eq!(out.raw.dims(), expected);
        assert_eq!(out.decoded.dims(), expected);
    }
}

#[test]
fn decoded_centers_land_in_their_cells() {
    let device = Default::default();
    let cfg = Yolo3dConfig {
        base_channels: 2,
        ..Default::default()
    };
    let model = Yolo3d::<B>::new(&cfg, &device);
    let outputs = model.forward(Tensor::<B, 5>::zeros([1, 1, 32, 32, 32], &device));
    let small = &outputs[0];
    let [_, d, h, w, a, f] = small.decoded.dims();
    let values = small.decoded.clone().into_data().to_vec::<f32>().unwrap();
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                for anchor in 0..a {
                    let base = ((((z * h) + y) * w + x) * a + anchor) * f;
                    let cz = values[base];
                    let cy = values[base + 1];
                    let cx = values[base + 2];
                    assert!(cz >= (z * 8) as f32 && cz <= ((z + 1) * 8) as f32);
                    assert!(cy >= (y * 8) as f32 && cy <= ((y + 1) * 8) as f32);
                    assert!(cx >= (x * 8) as f32 && cx <= ((x + 1) * 8) as f32);
                    let conf = values[base + 6];
                    assert!((0.0..=1.0).contains(&conf));
                }
            }
        }
    }
}
