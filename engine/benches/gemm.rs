use criterion::{criterion_group, criterion_main, Criterion};
use hartree_engine::{gemm, EngineConfig};
use hartree_linalg::Matrix;
use hartree_runtime::CommShape;

fn bench_gemm(c: &mut Criterion) {
    let n = 512;
    let a = Matrix::<f32>::rand_uniform(n, n, -1.0, 1.0, 1);
    let b = Matrix::<f32>::rand_uniform(n, n, -1.0, 1.0, 2);
    let mut out = Matrix::<f32>::zeros(n, n);

    let serial = EngineConfig { shape: Some(CommShape::default()), use_strassen: false };
    c.bench_function("gemm_f32_512_serial", |bench| {
        bench.iter(|| {
            gemm(&serial, n, n, n, a.data(), n, b.data(), n, out.data_mut(), n).unwrap();
        })
    });

    let threaded = EngineConfig {
        shape: Some(CommShape { jc_nt: 2, pc_nt: 1, ic_nt: 2, jr_nt: 1 }),
        use_strassen: false,
    };
    c.bench_function("gemm_f32_512_2x2", |bench| {
        bench.iter(|| {
            gemm(&threaded, n, n, n, a.data(), n, b.data(), n, out.data_mut(), n).unwrap();
        })
    });
}

criterion_group!(benches, bench_gemm);
criterion_main!(benches);
