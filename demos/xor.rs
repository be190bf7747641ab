use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng, rngs::StdRng};
use wmatrix::nn::{Adam, Layer, Loss, Network, NetworkCache, Optimizer, Sigmoid, Tanh};
use wmatrix::{ContextConfig, DeviceContext, Dtype, Event, Tensor};

fn main() -> wmatrix::Result<()> {
    // should noise be applied to the input?
    const USE_NOISE: bool = true;
    // half-width of the uniform input noise
    const NOISE: f64 = 0.1;

    let base_inputs = [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
    let base_targets = [0.0, 1.0, 1.0, 0.0];

    let ctx = DeviceContext::from_config(ContextConfig::from_env())?;
    let mut rng = StdRng::seed_from_u64(7);

    // model: 2 → 4 → 1
    let hidden = Layer::dense(&ctx, &[2, 4], Dtype::F32, true, Tanh, &mut rng)?;
    let head = Layer::dense(&ctx, &[4, 1], Dtype::F32, true, Sigmoid, &mut rng)?;
    let mut net = Network::new(vec![hidden, head])?;
    let mut opt = Optimizer::new(Adam::new(0.02), &net)?;
    let mut cache = NetworkCache::new();

    let epochs = 1000;
    let mut ready = Event::complete();
    for epoch in 0..epochs {
        let mut idx = [0, 1, 2, 3];
        idx.shuffle(&mut rng);

        let mut inputs = Vec::with_capacity(8);
        let mut targets = Vec::with_capacity(4);
        for &i in &idx {
            for v in base_inputs[i] {
                let noise = if USE_NOISE { rng.random_range(-NOISE..NOISE) } else { 0.0 };
                inputs.push(v + noise);
            }
            targets.push(base_targets[i]);
        }
        let x = Tensor::from_f64(&ctx, 4, 2, Dtype::F32, &inputs)?;
        let y = Tensor::from_f64(&ctx, 4, 1, Dtype::F32, &targets)?;

        let (prediction, ev) = net.forward(&x, &mut cache, &[ready])?;
        let (loss, seed) = Loss::Mse.compute(&prediction, &y, true, &[ev])?;
        let Some(seed) = seed else { unreachable!("gradient requested") };
        let grads = net.backward(seed, &cache, &[])?;
        ready = opt.step(&mut net, &grads, &[])?;

        if epoch % 100 == 0 {
            println!("epoch {epoch}: loss = {loss:.6}");
        }
    }

    let x = Tensor::from_f64(&ctx, 4, 2, Dtype::F32, base_inputs.as_flattened())?;
    let (prediction, ev) = net.predict(&x, &[ready])?;
    let prediction = prediction.to_f64_vec(&[ev])?;
    let correct = prediction
        .iter()
        .zip(base_targets)
        .filter(|&(&p, t)| (p >= 0.5) == (t == 1.0))
        .count();
    for (input, p) in base_inputs.iter().zip(&prediction) {
        println!("{input:?} -> {p:.4}");
    }
    println!("accuracy: {correct}/4");
    Ok(())
}
