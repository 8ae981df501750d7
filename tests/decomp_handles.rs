mod common;

use std::sync::Arc;

use modalspace::dense::{compute_pod_matrices_direct_method, compute_pod_matrices_snaps_method};
use modalspace::{
    ArrayVector, DecompStage, DenseOptions, Dmd, DmdDecompPaths, Handle, JsonFileHandle,
    JsonMatrixStorage, LocalCluster, MatrixStorage, ModalError, Pod, PodDecompPaths,
    SingleProcess, TextMatrixStorage, TlsDmd, TlsDmdDecompPaths, Topology, VecHandle,
    VectorSpace, VectorSpaceConfig, WeightedInnerProduct,
};
use tempfile::tempdir;

use common::{
    as_handles, assert_allclose, assert_columns_close_up_to_sign, assert_vectors_close,
    collect_columns, empty_handles, init_logging, memory_handles, random_complex_data,
    random_data, weight_schemes,
};

fn space_on(topology: Arc<dyn Topology>, max_vecs: usize) -> VectorSpace<ArrayVector> {
    VectorSpace::new(
        topology,
        VectorSpaceConfig::default().with_max_vecs_per_node(max_vecs),
    )
    .with_inner_product(WeightedInnerProduct::default())
}

fn space(max_vecs: usize) -> VectorSpace<ArrayVector> {
    space_on(Arc::new(SingleProcess), max_vecs)
}

#[test]
fn pod_modes_match_dense_reference() {
    init_logging();
    let data = random_data(20, 10, 101);
    for (name, weights) in weight_schemes(20) {
        let options = DenseOptions::default().with_weights(weights.clone());
        let snaps = compute_pod_matrices_snaps_method(&data, &[2, 0, 3], &options)
            .unwrap_or_else(|e| panic!("{name} snaps: {e}"));
        let direct = compute_pod_matrices_direct_method(&data, &[2, 0, 3], &options)
            .unwrap_or_else(|e| panic!("{name} direct: {e}"));
        assert_vectors_close(&direct.eigvals, &snaps.eigvals, 1e-7);
        assert_columns_close_up_to_sign(&direct.modes, &snaps.modes, 1e-7, 1e-12);

        let space = VectorSpace::new(
            Arc::new(SingleProcess),
            VectorSpaceConfig::default().with_max_vecs_per_node(4),
        )
        .with_inner_product(WeightedInnerProduct::new(weights).expect("weights"));
        let mut pod = Pod::new(space);
        let decomp = pod.compute_decomp(&memory_handles(&data)).expect("decomp");
        assert_vectors_close(&decomp.eigvals, &snaps.eigvals, 1e-7);

        let modes = empty_handles(3);
        pod.compute_modes(&[2, 0, 3], &as_handles(&modes), None)
            .expect("modes");
        assert_columns_close_up_to_sign(&collect_columns(&modes), &snaps.modes, 1e-7, 1e-12);
        assert_eq!(pod.stage(), DecompStage::ModesComputed);
    }
}

#[test]
fn pod_reconstructs_correlation_and_snapshots() {
    let data = random_complex_data(8, 5, 102);
    let mut pod = Pod::new(space(3));
    let handles = memory_handles(&data);
    let decomp = pod.compute_decomp(&handles).expect("decomp");
    let correlation = pod.correlation_mat().expect("correlation").clone();
    let sigma = nalgebra::DMatrix::from_diagonal(&decomp.eigvals.map(|v| num_complex::Complex64::new(v, 0.0)));
    let rebuilt = &decomp.eigvecs * sigma * decomp.eigvecs.adjoint();
    assert_allclose(&rebuilt, &correlation, 1e-10, 1e-12);

    let modes = empty_handles(decomp.num_modes());
    let indices: Vec<usize> = (0..decomp.num_modes()).collect();
    pod.compute_modes(&indices, &as_handles(&modes), None)
        .expect("modes");
    let proj = pod.compute_proj_coeffs().expect("projection");
    assert_allclose(&(collect_columns(&modes) * proj), &data, 1e-9, 1e-12);
}

#[test]
fn pod_runs_over_json_file_handles() {
    let dir = tempdir().expect("tempdir");
    let data = random_complex_data(6, 4, 103);
    let handles: Vec<Handle<ArrayVector>> = ArrayVector::columns_of(&data)
        .into_iter()
        .enumerate()
        .map(|(k, vec)| {
            let handle = JsonFileHandle::new(dir.path().join(format!("snap_{k}.json")));
            handle.release(&vec).expect("write snapshot");
            Arc::new(handle) as Handle<ArrayVector>
        })
        .collect();
    let outputs: Vec<Handle<ArrayVector>> = (0..2)
        .map(|k| Arc::new(JsonFileHandle::new(dir.path().join(format!("mode_{k}.json")))) as Handle<ArrayVector>)
        .collect();

    let mut pod = Pod::new(space(2));
    pod.sanity_check(&handles[0]).expect("sane handles");
    pod.compute_decomp(&handles).expect("decomp");
    pod.compute_modes(&[0, 1], &outputs, None).expect("modes");

    let mut reference = Pod::new(space(100));
    reference.compute_decomp(&memory_handles(&data)).expect("reference");
    let expected = empty_handles(2);
    reference
        .compute_modes(&[0, 1], &as_handles(&expected), None)
        .expect("reference modes");
    let written: Vec<_> = outputs
        .iter()
        .map(|h| h.acquire().expect("read mode").0)
        .collect();
    assert_allclose(
        &nalgebra::DMatrix::from_columns(&written),
        &collect_columns(&expected),
        1e-12,
        1e-14,
    );
}

#[test]
fn modes_before_decomposition_are_not_computed() {
    let mut pod = Pod::new(space(4));
    let err = pod
        .compute_modes(&[0], &as_handles(&empty_handles(1)), None)
        .expect_err("no decomposition");
    assert!(matches!(err, ModalError::NotYetComputed(_)));
    assert!(matches!(pod.compute_proj_coeffs(), Err(ModalError::NotYetComputed(_))));
}

#[test]
fn dmd_state_survives_a_persist_round_trip() {
    init_logging();
    let dir = tempdir().expect("tempdir");
    let data = random_data(12, 8, 104);
    let handles = memory_handles(&data);
    let backends: Vec<Arc<dyn MatrixStorage>> = vec![
        Arc::new(TextMatrixStorage::new()),
        Arc::new(JsonMatrixStorage),
    ];
    for (k, storage) in backends.into_iter().enumerate() {
        let paths = DmdDecompPaths::in_dir(dir.path().join(format!("backend_{k}")));

        let mut dmd = Dmd::new(space(5)).with_storage(Arc::clone(&storage));
        dmd.compute_decomp(&handles, None).expect("decomp");
        dmd.compute_spectrum().expect("spectrum");
        dmd.compute_proj_coeffs().expect("projection");
        dmd.put_decomp(&paths).expect("put decomp");
        let spectrum_path = dir.path().join(format!("spectrum_{k}.txt"));
        dmd.put_spectral_coeffs(&spectrum_path).expect("put spectrum");
        let cross_path = dir.path().join(format!("cross_{k}.txt"));
        dmd.put_cross_correlation_mat(&cross_path).expect("put cross");

        let mut reloaded = Dmd::new(space(5)).with_storage(Arc::clone(&storage));
        reloaded.get_decomp(&paths).expect("get decomp");
        assert_eq!(reloaded.decomp(), dmd.decomp());
        assert_eq!(
            storage.get_real(&spectrum_path).expect("spectrum").as_slice(),
            dmd.spectral_coeffs().expect("spectrum").as_slice()
        );

        reloaded.set_cross_correlation_mat(storage.get_complex(&cross_path).expect("cross"));
        let (proj, adv_proj) = reloaded.compute_proj_coeffs().expect("reloaded projection");
        assert_eq!(Some(&proj), dmd.proj_coeffs());
        assert_eq!(Some(&adv_proj), dmd.adv_proj_coeffs());

        let modes = empty_handles(2);
        reloaded
            .compute_proj_modes(&[1, 0], &as_handles(&modes), Some(&handles[..7]))
            .expect("modes from reloaded state");
        let expected = empty_handles(2);
        dmd.compute_proj_modes(&[1, 0], &as_handles(&expected), None)
            .expect("modes");
        assert_eq!(collect_columns(&modes), collect_columns(&expected));
    }
}

#[test]
fn pod_and_tls_state_survive_a_persist_round_trip() {
    let dir = tempdir().expect("tempdir");
    let storage: Arc<dyn MatrixStorage> = Arc::new(TextMatrixStorage::new().with_delimiter(','));
    let data = random_complex_data(9, 7, 105);
    let handles = memory_handles(&data);

    let pod_paths = PodDecompPaths::in_dir(dir.path());
    let mut pod = Pod::new(space(4)).with_storage(Arc::clone(&storage));
    pod.compute_decomp(&handles).expect("pod");
    pod.put_decomp(&pod_paths).expect("put pod");
    pod.put_correlation_mat(&dir.path().join("pod_corr.txt")).expect("put correlation");
    let mut reloaded = Pod::new(space(4)).with_storage(Arc::clone(&storage));
    reloaded.get_decomp(&pod_paths).expect("get pod");
    assert_eq!(reloaded.decomp(), pod.decomp());

    let tls_paths = TlsDmdDecompPaths::in_dir(dir.path());
    let mut tls = TlsDmd::new(space(4))
        .with_storage(Arc::clone(&storage))
        .with_max_num_eigvals(3);
    tls.compute_decomp(&handles, None).expect("tls");
    tls.put_decomp(&tls_paths).expect("put tls");
    tls.put_adv_correlation_mat(&dir.path().join("tls_adv_corr.txt"))
        .expect("put advanced correlation");
    let mut reloaded = TlsDmd::new(space(4)).with_storage(Arc::clone(&storage));
    reloaded.get_decomp(&tls_paths).expect("get tls");
    assert_eq!(reloaded.decomp(), tls.decomp());
    assert_eq!(
        storage
            .get_complex(&dir.path().join("tls_adv_corr.txt"))
            .expect("advanced correlation"),
        *tls.adv_correlation_mat().expect("advanced correlation")
    );
}

#[test]
fn persisting_needs_state_and_storage() {
    let dir = tempdir().expect("tempdir");
    let paths = DmdDecompPaths::in_dir(dir.path());
    let mut dmd = Dmd::new(space(4));
    assert!(matches!(dmd.put_decomp(&paths), Err(ModalError::NotYetComputed(_))));
    dmd.compute_decomp(&memory_handles(&random_data(5, 4, 106)), None)
        .expect("decomp");
    assert!(matches!(dmd.put_decomp(&paths), Err(ModalError::Configuration(_))));

    let mut dmd = Dmd::new(space(4)).with_storage(Arc::new(TextMatrixStorage::new()));
    assert!(matches!(dmd.get_decomp(&paths), Err(ModalError::Io(_))));
}

#[test]
fn workers_reproduce_single_process_decompositions() {
    init_logging();
    let data = random_data(10, 9, 107);
    let handles = memory_handles(&data);

    let mut single = Dmd::new(space(6)).with_max_num_eigvals(6);
    let expected = single.compute_decomp(&handles, None).expect("single decomp");
    let expected_modes = empty_handles(3);
    single
        .compute_exact_modes(&[2, 0, 3], &as_handles(&expected_modes), None)
        .expect("single modes");

    let modes = empty_handles(3);
    let mode_handles = as_handles(&modes);
    let results = LocalCluster::new(3).run(|topology| {
        let mut dmd = Dmd::new(space_on(topology, 6)).with_max_num_eigvals(6);
        let decomp = dmd.compute_decomp(&handles, None)?;
        dmd.compute_exact_modes(&[2, 0, 3], &mode_handles, None)?;
        Ok::<_, ModalError>(decomp)
    });
    for result in results {
        let decomp = result.expect("worker decomp");
        assert_eq!(decomp.num_modes(), expected.num_modes());
        assert_allclose(&decomp.r_low_order_eigvecs, &expected.r_low_order_eigvecs, 1e-10, 1e-12);
    }
    assert_allclose(&collect_columns(&modes), &collect_columns(&expected_modes), 1e-10, 1e-12);
}

#[test]
fn a_failing_handle_aborts_every_worker() {
    let data = random_data(6, 6, 108);
    let mut handles = memory_handles(&data);
    handles[4] = Arc::new(modalspace::MemoryHandle::<ArrayVector>::empty());
    let results = LocalCluster::new(2).run(|topology| {
        let mut pod = Pod::new(space_on(topology, 4));
        pod.compute_decomp(&handles).map(|_| ())
    });
    for result in results {
        assert!(result.is_err());
    }
}
