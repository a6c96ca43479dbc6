use ndarray::{arr1, ArrayD, IxDyn};
use rtorch_optim::optim::{
    orthogonalize, Adam, AdamConfig, Lookahead, LookaheadConfig, OrthoGrad, OrthoGradConfig, ParamGroup, SGDConfig,
    TRACConfig, SGD, TRAC,
};
use rtorch_optim::tensor::{ops, Tensor};
use rtorch_optim::{OptimError, Optimizer, ParamKey};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn model() -> Vec<Tensor> {
    vec![
        Tensor::from_vec(&[3], vec![0.5, -1.5, 2.0]).unwrap(),
        Tensor::from_vec(&[2, 2], vec![1.0, 0.25, -0.75, 3.0]).unwrap(),
    ]
}

fn copy_of(params: &[Tensor]) -> Vec<Tensor> {
    params.iter().map(|p| Tensor::new(p.data_clone(), true)).collect()
}

/// Gradient of `0.5 * ||w - 1||^2`.
fn quadratic_grads(params: &[Tensor]) {
    for p in params {
        p.set_grad(p.data().mapv(|w| w - 1.0));
    }
}

#[test]
fn orthograd_gradients_are_orthogonal_to_their_parameters() {
    init_logger();
    let params = model();
    // lr 0 keeps the parameters where the projection was taken
    let sgd = SGD::new(params.clone(), SGDConfig { lr: 0.0, ..Default::default() }).unwrap();
    let mut opt = OrthoGrad::new(sgd, OrthoGradConfig::default()).unwrap();
    params[0].set_grad(arr1(&[0.3, 2.0, -1.0]).into_dyn());
    params[1].set_grad(ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 1.0, -2.0, 0.5]).unwrap());
    let norms: Vec<f64> = params.iter().map(|p| ops::norm(&p.grad().unwrap())).collect();
    opt.step().unwrap();

    for (p, norm) in params.iter().zip(norms) {
        let grad = p.grad().unwrap();
        let cos = ops::dot(&grad, &p.data()) / (ops::norm(&grad) * ops::norm(&p.data()));
        assert!(cos.abs() < 1e-6, "cosine {cos}");
        assert!((ops::norm(&grad) - norm).abs() < 1e-5);
    }
}

#[test]
fn orthograd_is_a_pure_transform() {
    let p = arr1(&[2.0f32, 0.0]).into_dyn();
    let g = arr1(&[1.0f32, 1.0]).into_dyn();
    let ortho = orthogonalize(&p, &g, 1e-30);
    assert!(ortho[[0]].abs() < 1e-6);
    assert!((ortho[[1]] - 2f32.sqrt()).abs() < 1e-6);
    assert_eq!(g, arr1(&[1.0f32, 1.0]).into_dyn());
}

#[test]
fn lookahead_synchronizes_every_k_steps() {
    init_logger();
    let params = model();
    let twin = copy_of(&params);
    let slow_0: Vec<ArrayD<f32>> = params.iter().map(Tensor::data_clone).collect();

    let cfg = AdamConfig { lr: 0.05, ..Default::default() };
    let mut opt = Lookahead::with_constructor(
        params.clone(),
        move |p| Adam::new(p, cfg),
        LookaheadConfig { k: 5, alpha: 0.5 },
    )
    .unwrap();
    let mut plain = Adam::new(twin.clone(), AdamConfig { lr: 0.05, ..Default::default() }).unwrap();

    for step in 1..=5 {
        quadratic_grads(&params);
        quadratic_grads(&twin);
        opt.step().unwrap();
        plain.step().unwrap();
        if step < 5 {
            for (i, slow) in slow_0.iter().enumerate() {
                assert_eq!(opt.slow_weights(ParamKey::new(0, i)).unwrap(), slow);
            }
        }
    }

    for (i, ((p, fast_k), slow)) in params.iter().zip(&twin).zip(&slow_0).enumerate() {
        let expected = slow + &((&*fast_k.data() - slow) * 0.5f32);
        let synced = opt.slow_weights(ParamKey::new(0, i)).unwrap();
        assert_eq!(&*p.data(), synced);
        for (a, b) in synced.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}

#[test]
fn lookahead_rejects_regrouped_inner_optimizer() {
    let params = model();
    let sgd = SGD::simple(params.clone(), 0.1).unwrap();
    let mut opt = Lookahead::new(sgd, LookaheadConfig::default()).unwrap();
    opt.inner_mut()
        .add_param_group(ParamGroup::new(vec![Tensor::from_vec(&[1], vec![0.0]).unwrap()], SGDConfig::default()))
        .unwrap();

    quadratic_grads(&params);
    let err = opt.step().unwrap_err();
    assert!(matches!(err, OptimError::GroupMismatch { wrapper: "lookahead", .. }));
}

#[test]
fn trac_scale_grows_under_a_consistent_gradient() {
    init_logger();
    let params = model();
    let sgd = SGD::simple(params.clone(), 0.01).unwrap();
    let mut opt = TRAC::new(sgd, TRACConfig::default()).unwrap();

    let mut scales = Vec::new();
    for _ in 0..10 {
        // linear loss: the gradient never changes
        for p in &params {
            p.set_grad(ArrayD::ones(IxDyn(p.shape())));
        }
        opt.step().unwrap();
        scales.push(opt.scale(0).unwrap());
    }
    assert!(scales.iter().all(|s| s.is_finite() && *s > 0.0));
    assert!(scales[9] > scales[2], "{scales:?}");
}

#[test]
fn trac_leaves_a_parameter_with_a_non_finite_gradient_alone() {
    init_logger();
    let params = model();
    let sgd = SGD::simple(params.clone(), 0.01).unwrap();
    let mut opt = TRAC::new(sgd, TRACConfig::default()).unwrap();
    for _ in 0..20 {
        quadratic_grads(&params);
        opt.step().unwrap();
    }

    let key = ParamKey::new(0, 1);
    let before = params[1].data_clone();
    let state_before = opt.state_dict().params[&key].clone();
    let other_before = params[0].data_clone();

    quadratic_grads(&params);
    params[1].set_grad(ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![f32::NAN, 1.0, 1.0, 1.0]).unwrap());
    opt.step().unwrap();

    assert_eq!(params[1].data_clone(), before);
    assert_eq!(opt.state_dict().params[&key], state_before);
    assert_ne!(params[0].data_clone(), other_before);
}

#[test]
fn trac_keeps_edits_to_frozen_parameters() {
    let trained = Tensor::from_vec(&[3], vec![0.5, -1.5, 2.0]).unwrap();
    let frozen = Tensor::new(ArrayD::from_elem(IxDyn(&[2]), 0.5f32), false);
    let params = vec![trained.clone(), frozen.clone()];
    let sgd = SGD::simple(params.clone(), 0.01).unwrap();
    let mut opt = TRAC::new(sgd, TRACConfig::default()).unwrap();

    for _ in 0..5 {
        quadratic_grads(&params);
        opt.step().unwrap();
    }
    assert_eq!(frozen.data_clone(), ArrayD::from_elem(IxDyn(&[2]), 0.5f32));

    frozen.assign(&ArrayD::from_elem(IxDyn(&[2]), 7.0f32)).unwrap();
    quadratic_grads(&params);
    opt.step().unwrap();
    assert_eq!(frozen.data_clone(), ArrayD::from_elem(IxDyn(&[2]), 7.0f32));
}

#[test]
fn trac_can_wrap_lookahead() {
    let params = model();
    let adam = Adam::new(params.clone(), AdamConfig { lr: 0.05, ..Default::default() }).unwrap();
    let inner = Lookahead::new(adam, LookaheadConfig { k: 3, alpha: 0.5 }).unwrap();
    let mut opt = TRAC::new(inner, TRACConfig::default()).unwrap();
    for _ in 0..7 {
        quadratic_grads(&params);
        opt.step().unwrap();
    }
    assert_eq!(opt.name(), "trac");
    assert_eq!(opt.inner().name(), "lookahead");
    assert!(opt.scale(0).unwrap() > 0.0);
    assert!(params.iter().all(|p| p.data().iter().all(|v| v.is_finite())));
}

#[test]
fn lookahead_over_trac_over_orthograd() {
    let params = model();
    let inner = OrthoGrad::new(SGD::simple(params.clone(), 0.05).unwrap(), OrthoGradConfig::default()).unwrap();
    let inner = TRAC::new(inner, TRACConfig::default()).unwrap();
    let mut opt = Lookahead::new(inner, LookaheadConfig { k: 2, alpha: 0.5 }).unwrap();
    for _ in 0..4 {
        quadratic_grads(&params);
        opt.step().unwrap();
        opt.zero_grad();
    }
    assert_eq!(opt.name(), "lookahead");
    assert_eq!(opt.inner().inner().name(), "orthograd");
    assert!(params.iter().all(|p| p.data().iter().all(|v| v.is_finite())));
    assert!(params.iter().all(|p| p.grad().unwrap().iter().all(|&g| g == 0.0)));
}
