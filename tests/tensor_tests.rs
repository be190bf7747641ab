use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use num_complex::Complex64;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing_subscriber::EnvFilter;
use wmatrix::approx::approx_eq_slice;
use wmatrix::device::gc::{GarbageWorker, Reclaim, RetryPolicy};
use wmatrix::tensor::gemm::{matmul, matmul_tiled};
use wmatrix::tensor::{linalg, reduce};
use wmatrix::{ContextConfig, DeviceContext, Dtype, Error, ReleaseError, Tensor};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn views_never_release_their_owner() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let before = ctx.stats().live_buffers;

    let t = Tensor::zeros(&ctx, 4, 4, Dtype::F32).unwrap();
    t.promote_complex().unwrap();
    assert_eq!(ctx.stats().live_buffers, before + 2);
    {
        let view = t.view(1, 1, 2, 2).unwrap();
        let inner = view.view(0, 0, 1, 1).unwrap();
        assert_eq!(inner.origin(), (1, 1));
    }
    ctx.wait_releases();
    assert_eq!(ctx.stats().live_buffers, before + 2);

    drop(t);
    ctx.wait_releases();
    assert_eq!(ctx.stats().live_buffers, before);
}

#[test]
fn failed_gemm_allocates_nothing() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let a = Tensor::zeros(&ctx, 2, 3, Dtype::F64).unwrap();
    let b = Tensor::zeros(&ctx, 2, 3, Dtype::F64).unwrap();
    let live = ctx.stats().live_buffers;
    assert!(matches!(matmul(&a, &b, &[]), Err(Error::ShapeMismatch { .. })));
    assert_eq!(ctx.stats().live_buffers, live);

    let rhs = Tensor::zeros(&ctx, 3, 5, Dtype::F64).unwrap();
    let (c, ev) = matmul(&a, &rhs, &[]).unwrap();
    ev.wait().unwrap();
    assert_eq!(c.shape(), (2, 5));
}

#[test]
fn promotion_keeps_the_imaginary_part() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let t = Tensor::from_f64(&ctx, 1, 2, Dtype::F64, &[1.0, 2.0]).unwrap();
    t.promote_complex().unwrap();
    let ev = t
        .write_complex(&[Complex64::new(1.0, 3.0), Complex64::new(2.0, -4.0)], &[])
        .unwrap();
    ev.wait().unwrap();
    t.promote_complex().unwrap();
    assert_eq!(
        t.to_complex_vec(&[]).unwrap(),
        vec![Complex64::new(1.0, 3.0), Complex64::new(2.0, -4.0)]
    );
}

#[test]
fn tiled_gemm_matches_plain_gemm() {
    init_tracing();
    let cfg = ContextConfig::default().with_queues(4).with_tile_threshold(16);
    let ctx = DeviceContext::from_config(cfg).unwrap();
    let mut rng = StdRng::seed_from_u64(12);
    let mut sample = |n: usize| (0..n).map(|_| rng.random_range(-1.0..1.0)).collect::<Vec<f64>>();
    let a = Tensor::from_f64(&ctx, 64, 48, Dtype::F64, &sample(64 * 48)).unwrap();
    let b = Tensor::from_f64(&ctx, 48, 32, Dtype::F64, &sample(48 * 32)).unwrap();

    let (plain, ev1) = matmul(&a, &b, &[]).unwrap();
    let (tiled, ev2) = matmul_tiled(&a, &b, &[]).unwrap();
    assert!(approx_eq_slice(
        &plain.to_f64_vec(&[ev1]).unwrap(),
        &tiled.to_f64_vec(&[ev2]).unwrap()
    ));
}

#[test]
fn reductions_and_linear_algebra() {
    init_tracing();
    let ctx = DeviceContext::cpu().unwrap();
    let a = Tensor::from_f64(&ctx, 2, 2, Dtype::F64, &[4.0, 7.0, 2.0, 6.0]).unwrap();
    assert!((reduce::sum(&a, &[]).unwrap().re - 19.0).abs() < 1e-12);
    assert!((reduce::trace(&a, &[]).unwrap().re - 10.0).abs() < 1e-12);
    assert!((linalg::determinant(&a, &[]).unwrap().re - 10.0).abs() < 1e-12);
    assert_eq!(linalg::rank(&a, &[]).unwrap(), 2);

    let (inv, ev) = linalg::inverse(&a, &[]).unwrap();
    assert!(approx_eq_slice(
        &inv.to_f64_vec(&[ev]).unwrap(),
        &[0.6, -0.7, -0.2, 0.4]
    ));

    let singular = Tensor::from_f64(&ctx, 2, 2, Dtype::F64, &[1.0, 2.0, 2.0, 4.0]).unwrap();
    assert!(matches!(linalg::inverse(&singular, &[]), Err(Error::Singular)));
}

struct Item {
    id: usize,
    busy: Arc<AtomicBool>,
    released: Arc<Mutex<HashMap<usize, usize>>>,
}

impl Reclaim for Item {
    fn reclaim(&mut self) -> Result<(), ReleaseError> {
        if self.busy.load(Ordering::Acquire) {
            return Err(ReleaseError::Busy);
        }
        *self.released.lock().entry(self.id).or_default() += 1;
        Ok(())
    }
}

#[test]
fn release_worker_drains_concurrent_frees() {
    init_tracing();
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;
    const TOTAL: usize = THREADS * PER_THREAD;

    let worker = Arc::new(
        GarbageWorker::spawn(RetryPolicy {
            backoff: Duration::from_micros(20),
            max_retries: None,
        })
        .unwrap(),
    );
    let busy = Arc::new(AtomicBool::new(true));
    let released = Arc::new(Mutex::new(HashMap::new()));
    let is_busy = |id: usize| id % 7 == 0;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let worker = Arc::clone(&worker);
            let busy = Arc::clone(&busy);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let id = t * PER_THREAD + i;
                    let flag = if is_busy(id) {
                        Arc::clone(&busy)
                    } else {
                        Arc::new(AtomicBool::new(false))
                    };
                    worker.push(Item {
                        id,
                        busy: flag,
                        released: Arc::clone(&released),
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let busy_count = (0..TOTAL).filter(|&id| is_busy(id)).count();
    let deadline = Instant::now() + Duration::from_secs(10);
    while released.lock().len() < TOTAL - busy_count {
        assert!(Instant::now() < deadline, "free items were not released");
        thread::sleep(Duration::from_millis(1));
    }
    assert!(released.lock().keys().all(|&id| !is_busy(id)));
    assert!(worker.len() >= busy_count);

    busy.store(false, Ordering::Release);
    worker.wait_idle();
    let released = released.lock();
    assert_eq!(released.len(), TOTAL);
    assert!(released.values().all(|&count| count == 1));
    let stats = worker.stats();
    assert_eq!(stats.reclaimed, TOTAL as u64);
    assert_eq!(stats.dropped, 0);
}
