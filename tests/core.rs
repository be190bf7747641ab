use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::{SeedableRng, rngs::StdRng};
use tracing_subscriber::EnvFilter;
use wmatrix::nn::{
    Activation, AdaGrad, Adadelta, Adam, GradientSignal, LeakyRelu, Layer, Loss, Network,
    NetworkCache, Optimizer, Relu, Sigmoid, Softmax, Tanh,
};
use num_complex::Complex64;
use wmatrix::tensor::ops::fill;
use wmatrix::{DeviceContext, Dtype, Event, Tensor, UserEvent};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn tensor(ctx: &Arc<DeviceContext>, rows: usize, cols: usize, data: &[f64]) -> Tensor {
    Tensor::from_f64(ctx, rows, cols, Dtype::F64, data).unwrap()
}

fn apply(act: &dyn Activation, ctx: &Arc<DeviceContext>, z: &[f64]) -> Vec<f64> {
    let t = tensor(ctx, 1, z.len(), z);
    let ev = act.forward(&t, &[]).unwrap();
    t.to_f64_vec(&[ev]).unwrap()
}

#[test]
fn derivatives_match_finite_differences() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let z = [-2.0, -0.7, -0.1, 0.3, 1.1, 2.5];
    let h = 1e-5;
    let acts: [&dyn Activation; 3] = [&Sigmoid, &Tanh, &Relu];
    for act in acts {
        let y = apply(act, &ctx, &z);
        let ahead = apply(act, &ctx, &z.map(|v| v + h));
        let behind = apply(act, &ctx, &z.map(|v| v - h));

        let out = tensor(&ctx, 1, z.len(), &y);
        let (d, ev) = act.derivative(&out, &[]).unwrap();
        let analytic = d.to_f64_vec(&[ev]).unwrap();
        for i in 0..z.len() {
            let numeric = (ahead[i] - behind[i]) / (2.0 * h);
            assert!(
                (numeric - analytic[i]).abs() < 1e-6,
                "{} at {}: {numeric} vs {}",
                act.name(),
                z[i],
                analytic[i]
            );
        }
    }
}

#[test]
fn diagonal_derivatives_match_single_element_differences() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    // two rows so the softmax normalization stays per row
    let z = [-1.5, -0.2, 0.4, 2.0, 0.3, -0.8, 1.2, -2.5];
    let (rows, cols) = (2, 4);
    let h = 1e-5;
    let leaky = LeakyRelu::new(0.2);
    let acts: [&dyn Activation; 2] = [&leaky, &Softmax];
    for act in acts {
        let forward = |input: &[f64]| {
            let t = tensor(&ctx, rows, cols, input);
            let ev = act.forward(&t, &[]).unwrap();
            t.to_f64_vec(&[ev]).unwrap()
        };
        let y = forward(&z);
        let out = tensor(&ctx, rows, cols, &y);
        let (d, ev) = act.derivative(&out, &[]).unwrap();
        let analytic = d.to_f64_vec(&[ev]).unwrap();
        for i in 0..z.len() {
            let mut ahead = z;
            ahead[i] += h;
            let mut behind = z;
            behind[i] -= h;
            let numeric = (forward(&ahead)[i] - forward(&behind)[i]) / (2.0 * h);
            assert!(
                (numeric - analytic[i]).abs() < 1e-6,
                "{} at {}: {numeric} vs {}",
                act.name(),
                z[i],
                analytic[i]
            );
        }
    }
}

#[test]
fn learns_logical_and() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let layer = Layer::dense(&ctx, &[2, 1], Dtype::F64, true, Sigmoid, &mut rng).unwrap();
    let mut net = Network::new(vec![layer]).unwrap();
    let mut opt = Optimizer::new(AdaGrad::new(2.0), &net).unwrap();

    let x = tensor(&ctx, 4, 2, &[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    let t = tensor(&ctx, 4, 1, &[0.0, 0.0, 0.0, 1.0]);
    let mut cache = NetworkCache::new();
    let mut ready = Event::complete();
    for _ in 0..10_000 {
        let (out, ev) = net.forward(&x, &mut cache, &[ready]).unwrap();
        let (_, seed) = Loss::Mse.compute(&out, &t, true, &[ev]).unwrap();
        let grads = net.backward(seed.unwrap(), &cache, &[]).unwrap();
        ready = opt.step(&mut net, &grads, &[]).unwrap();
    }

    let (out, ev) = net.predict(&x, &[ready]).unwrap();
    let (mse, _) = Loss::Mse.compute(&out, &t, false, &[ev]).unwrap();
    assert!(mse < 0.01, "mse {mse}");
    let predicted = out.to_f64_vec(&[]).unwrap();
    assert!(predicted[3] > 0.5 && predicted[..3].iter().all(|&p| p < 0.5));
}

#[test]
fn two_layer_network_reduces_loss_with_adam() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let hidden = Layer::dense(&ctx, &[2, 8], Dtype::F64, true, Tanh, &mut rng).unwrap();
    let head = Layer::dense(&ctx, &[8, 1], Dtype::F64, true, Sigmoid, &mut rng).unwrap();
    let mut net = Network::new(vec![hidden, head]).unwrap();
    let mut opt = Optimizer::new(Adam::new(0.05), &net).unwrap();

    // XOR
    let x = tensor(&ctx, 4, 2, &[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    let t = tensor(&ctx, 4, 1, &[0.0, 1.0, 1.0, 0.0]);
    let mut cache = NetworkCache::new();
    let (out, ev) = net.predict(&x, &[]).unwrap();
    let (initial, _) = Loss::Mse.compute(&out, &t, false, &[ev]).unwrap();

    let mut ready = Event::complete();
    for _ in 0..500 {
        let (out, ev) = net.forward(&x, &mut cache, &[ready]).unwrap();
        let (_, seed) = Loss::Mse.compute(&out, &t, true, &[ev]).unwrap();
        let grads = net.backward(seed.unwrap(), &cache, &[]).unwrap();
        ready = opt.step(&mut net, &grads, &[]).unwrap();
    }
    let (out, ev) = net.predict(&x, &[ready]).unwrap();
    let (trained, _) = Loss::Mse.compute(&out, &t, false, &[ev]).unwrap();
    assert!(trained < initial / 2.0, "{initial} -> {trained}");
}

#[test]
fn zero_resets_accumulators() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let layer = Layer::dense(&ctx, &[3, 2], Dtype::F32, true, Sigmoid, &mut rng).unwrap();
    let mut net = Network::new(vec![layer]).unwrap();
    let mut adadelta = Optimizer::new(Adadelta::new(), &net).unwrap();
    let mut adam = Optimizer::new(Adam::new(0.1), &net).unwrap();

    let x = Tensor::from_f64(&ctx, 2, 3, Dtype::F32, &[1.0, 2.0, 3.0, -1.0, 0.5, 0.0]).unwrap();
    let t = Tensor::from_f64(&ctx, 2, 2, Dtype::F32, &[1.0, 0.0, 0.0, 1.0]).unwrap();
    let mut cache = NetworkCache::new();
    for _ in 0..3 {
        let (out, ev) = net.forward(&x, &mut cache, &[]).unwrap();
        let (_, seed) = Loss::Mse.compute(&out, &t, true, &[ev]).unwrap();
        let grads = net.backward(seed.unwrap(), &cache, &[]).unwrap();
        adadelta.step(&mut net, &grads, &[]).unwrap().wait().unwrap();
        adam.step(&mut net, &grads, &[]).unwrap().wait().unwrap();
    }

    let ev = adadelta.zero().unwrap();
    for i in 0..net.parameter_count() {
        let state = adadelta.state(i).unwrap();
        let acc = state[0].to_f64_vec(&[ev.clone()]).unwrap();
        let upd = state[1].to_f64_vec(&[ev.clone()]).unwrap();
        assert!(acc.iter().all(|&v| v == 0.0));
        assert!(upd.iter().all(|&v| v == 1.0));
    }

    let ev = adam.zero().unwrap();
    assert_eq!(adam.steps(), 0);
    for i in 0..net.parameter_count() {
        for moment in adam.state(i).unwrap() {
            assert!(moment.to_f64_vec(&[ev.clone()]).unwrap().iter().all(|&v| v == 0.0));
        }
    }
}

#[test]
fn propagated_errors_cover_every_sub_layer() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    let layer = Layer::dense(&ctx, &[4, 3, 2], Dtype::F64, false, Sigmoid, &mut rng).unwrap();
    let net = Network::new(vec![layer]).unwrap();
    let x = Tensor::zeros(&ctx, 5, 4, Dtype::F64).unwrap();
    let mut cache = NetworkCache::new();
    let (out, ev) = net.forward(&x, &mut cache, &[]).unwrap();
    let (seed, seed_ev) = Tensor::full(&ctx, out.rows(), out.cols(), Dtype::F64, 0.5).unwrap();
    let grads = net
        .backward(GradientSignal::new(seed, seed_ev), &cache, &[ev])
        .unwrap();

    let input = grads.input_error();
    let shapes: Vec<_> = input.propagated().iter().map(Tensor::shape).collect();
    assert_eq!(shapes, vec![(5, 3), (5, 2)]);
    assert!(grads.layers()[0].biases().iter().all(Option::is_none));
    Event::wait_all(&grads.events()).unwrap();
}

#[test]
fn busy_tensor_release_is_deferred_until_its_kernel_ran() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let baseline = ctx.stats().live_buffers;

    let t = Tensor::zeros(&ctx, 8, 8, Dtype::F64).unwrap();
    let gate = UserEvent::new("gate");
    let filled = fill(&t, Complex64::new(2.0, 0.0), &[gate.event()]).unwrap();
    drop(t);
    assert_eq!(ctx.pending_releases(), 1);
    assert_eq!(ctx.stats().live_buffers, baseline + 1);

    // let the worker find the buffer still pinned at least once
    thread::sleep(Duration::from_millis(20));
    gate.signal();
    filled.wait().unwrap();
    ctx.wait_releases();

    assert_eq!(ctx.pending_releases(), 0);
    assert_eq!(ctx.stats().live_buffers, baseline);
    let gc = ctx.gc_stats();
    assert_eq!(gc.reclaimed, 1);
    assert_eq!(gc.dropped, 0);
    assert!(gc.retries >= 1);
}
