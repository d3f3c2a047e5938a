use super::*;

fn filled(ctx: &Context, ne0: usize, ne1: usize, values: &[f32]) -> Tensor {
    let t = ctx.new_tensor_2d(Type::F32, ne0, ne1);
    t.write_data(bytemuck::cast_slice(values));
    t
}

fn compute_all(result: &Tensor, n_threads: usize) -> Result<(), ComputeError> {
    let mut graph = ComputationGraph::new();
    graph.build_forward_expand(result);
    let mut plan = GraphPlan::new(&graph, n_threads);
    graph.compute(&mut plan)
}

#[test]
fn tensor_bytes_match_type_tables() {
    let ctx = Context::new(1024 * 1024);
    for ty in [
        Type::F32,
        Type::F16,
        Type::Q4_0,
        Type::Q4_1,
        Type::Q5_0,
        Type::Q5_1,
        Type::Q8_0,
        Type::Q8_1,
        Type::I32,
    ] {
        let t = ctx.new_tensor_2d(ty, 64, 3);
        assert_eq!(t.nelements(), 192);
        assert_eq!(t.nbytes(), 192 / blck_size(ty) * type_size(ty), "wrong size for {ty}");
    }
}

#[test]
fn strides_follow_block_layout() {
    let ctx = Context::new(1024 * 1024);
    let t = ctx.new_tensor_3d(Type::Q4_0, 64, 5, 2);
    let nb = t.get_nb();
    assert_eq!(nb[0], type_size(Type::Q4_0));
    assert_eq!(nb[1], 64 / 32 * type_size(Type::Q4_0));
    assert_eq!(nb[2], nb[1] * 5);
}

#[test]
fn names_truncate_to_limit() {
    let ctx = Context::new(1024);
    let t = ctx.new_tensor_1d(Type::F32, 1);
    t.set_name(&"x".repeat(100));
    assert_eq!(t.name().len(), MAX_NAME_LEN);
}

#[test]
fn add_and_mul_are_elementwise() {
    let ctx = Context::new(1024 * 1024);
    let a = filled(&ctx, 4, 1, &[1.0, 2.0, 3.0, 4.0]);
    let b = filled(&ctx, 4, 1, &[10.0, 20.0, 30.0, 40.0]);
    let sum = ctx.op_add(&a, &b);
    let prod = ctx.op_mul(&a, &b);
    let mut graph = ComputationGraph::new();
    graph.build_forward_expand(&sum);
    graph.build_forward_expand(&prod);
    let mut plan = GraphPlan::new(&graph, 1);
    graph.compute(&mut plan).unwrap();
    assert_eq!(sum.read_f32s(), vec![11.0, 22.0, 33.0, 44.0]);
    assert_eq!(prod.read_f32s(), vec![10.0, 40.0, 90.0, 160.0]);
}

#[test]
fn mul_mat_reduces_over_shared_dimension() {
    let ctx = Context::new(1024 * 1024);
    // a: 2 rows of length 3, b: 2 rows of length 3 -> 2x2
    let a = filled(&ctx, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = filled(&ctx, 3, 2, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    let out = ctx.op_mul_mat(&a, &b);
    compute_all(&out, 2).unwrap();
    // out[i, j] = dot(a row i, b row j)
    assert_eq!(out.read_f32s(), vec![1.0, 4.0, 2.0, 5.0]);
}

#[test]
fn mul_mat_quantized_approximates_f32() {
    let ctx = Context::new(4 * 1024 * 1024);
    let row: Vec<f32> = (0..64).map(|i| ((i % 7) as f32 - 3.0) / 3.0).collect();
    let q = quantize::quantize(Type::Q8_0, &row);
    let a = ctx.new_tensor_2d(Type::Q8_0, 64, 1);
    a.write_data(&q.output);
    let b = filled(&ctx, 64, 1, &vec![1.0; 64]);
    let out = ctx.op_mul_mat(&a, &b);
    compute_all(&out, 1).unwrap();
    let exact: f32 = row.iter().sum();
    let got = out.read_f32s()[0];
    assert!((got - exact).abs() < 0.5, "got {got}, want ~{exact}");
}

#[test]
fn soft_max_rows_sum_to_one() {
    let ctx = Context::new(1024 * 1024);
    let a = filled(&ctx, 3, 2, &[1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
    let sm = ctx.op_soft_max_inplace(&a);
    compute_all(&sm, 1).unwrap();
    let values = sm.read_f32s();
    let row0: f32 = values[..3].iter().sum();
    let row1: f32 = values[3..].iter().sum();
    assert!((row0 - 1.0).abs() < 1e-6);
    assert!((row1 - 1.0).abs() < 1e-6);
    assert!(values[2] > values[1] && values[1] > values[0]);
}

#[test]
fn diag_mask_hides_future_positions() {
    let ctx = Context::new(1024 * 1024);
    // 4 keys x 2 query rows, n_past = 2
    let a = filled(&ctx, 4, 2, &[1.0; 8]);
    let masked = ctx.op_diag_mask_inf_inplace(&a, 2);
    compute_all(&masked, 1).unwrap();
    let values = masked.read_f32s();
    // Row 0 sees keys 0..=2, row 1 sees keys 0..=3.
    assert_eq!(values[3], f32::NEG_INFINITY);
    assert!(values[..3].iter().all(|&v| v == 1.0));
    assert!(values[4..].iter().all(|&v| v == 1.0));
}

#[test]
fn norm_centers_and_scales() {
    let ctx = Context::new(1024 * 1024);
    let a = filled(&ctx, 4, 1, &[1.0, 2.0, 3.0, 4.0]);
    let out = ctx.op_norm(&a, 1e-5);
    compute_all(&out, 1).unwrap();
    let values = out.read_f32s();
    let mean: f32 = values.iter().sum::<f32>() / 4.0;
    let var: f32 = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
    assert!(mean.abs() < 1e-5);
    assert!((var - 1.0).abs() < 1e-3);
}

#[test]
fn get_rows_looks_up_embeddings() {
    let ctx = Context::new(1024 * 1024);
    let table = filled(&ctx, 2, 3, &[0.0, 0.1, 1.0, 1.1, 2.0, 2.1]);
    let ids = ctx.new_tensor_1d(Type::I32, 2);
    ids.set_data_from_i32s(&[2, 0]);
    let rows = ctx.op_get_rows(&table, &ids);
    compute_all(&rows, 1).unwrap();
    assert_eq!(rows.read_f32s(), vec![2.0, 2.1, 0.0, 0.1]);
}

#[test]
fn view_2d_selects_column_band() {
    let ctx = Context::new(1024 * 1024);
    // 2 rows of [q q k k v v]
    let fused = filled(&ctx, 6, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    let k = ctx.op_view_2d(&fused, 2, 2, 2);
    let blank = ctx.new_tensor_2d(Type::F32, 2, 2);
    let out = ctx.op_cpy(&k, &blank);
    compute_all(&out, 1).unwrap();
    assert_eq!(out.read_f32s(), vec![3.0, 4.0, 9.0, 10.0]);
}

#[test]
fn permute_then_cpy_materializes_transpose() {
    let ctx = Context::new(1024 * 1024);
    let a = filled(&ctx, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let at = ctx.op_permute(&a, 1, 0, 2, 3);
    assert_eq!(at.shape(), vec![2, 3]);
    let blank = ctx.new_tensor_2d(Type::F32, 2, 3);
    let out = ctx.op_cpy(&at, &blank);
    compute_all(&out, 1).unwrap();
    assert_eq!(out.read_f32s(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
}

#[test]
fn graph_nodes_are_unique_and_ordered() {
    let ctx = Context::new(1024 * 1024);
    let a = filled(&ctx, 2, 1, &[1.0, 2.0]);
    let b = ctx.op_add(&a, &a);
    let c = ctx.op_mul(&b, &b);
    let mut graph = ComputationGraph::new();
    graph.build_forward_expand(&c);
    // a, b, c each appear exactly once, sources before consumers.
    assert_eq!(graph.len(), 3);
    let ids: Vec<usize> = graph.nodes().iter().map(|n| n.idx_for_tests()).collect();
    assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

#[test]
fn recorder_sizes_a_real_context() {
    let recorder = Context::new_recorder();
    recorder.new_tensor_2d(Type::F32, 128, 128);
    recorder.new_tensor_1d(Type::F32, 64);
    let size = recorder.recorded_size();
    assert!(size >= 128 * 128 * 4 + 64 * 4);

    let ctx = Context::new(size);
    ctx.new_tensor_2d(Type::F32, 128, 128);
    ctx.new_tensor_1d(Type::F32, 64);
}

#[test]
fn planned_context_reuses_dead_slots() {
    // Chain of adds: intermediates have disjoint lifetimes, so the planned
    // arena should be smaller than one slot per node.
    let run = |planned: bool| -> (Vec<f32>, usize) {
        let ctx = if planned {
            Context::new_planned(1024 * 1024)
        } else {
            Context::new(1024 * 1024)
        };
        let a = filled(&ctx, 256, 1, &[1.0; 256]);
        let mut cur = ctx.op_add(&a, &a);
        for _ in 0..8 {
            cur = ctx.op_add(&cur, &a);
        }
        let mut graph = ComputationGraph::new();
        graph.build_forward_expand(&cur);
        if planned {
            ctx.plan_from_graph(&graph);
        }
        let mut plan = GraphPlan::new(&graph, 1);
        graph.compute(&mut plan).unwrap();
        (cur.read_f32s(), ctx.recorded_size())
    };
    let (eager_out, eager_size) = run(false);
    let (planned_out, planned_size) = run(true);
    assert_eq!(eager_out, planned_out);
    assert!(planned_out.iter().all(|&v| v == 10.0));
    assert!(planned_size < eager_size, "planned {planned_size} >= eager {eager_size}");
}

#[test]
fn cancelled_plan_aborts_compute() {
    let ctx = Context::new(1024 * 1024);
    let a = filled(&ctx, 2, 1, &[1.0, 2.0]);
    let b = ctx.op_add(&a, &a);
    let mut graph = ComputationGraph::new();
    graph.build_forward_expand(&b);
    let mut plan = GraphPlan::new(&graph, 1);
    plan.cancel_token().cancel();
    assert!(matches!(graph.compute(&mut plan), Err(ComputeError::Cancelled)));
}

#[test]
fn scale_multiplies_in_place() {
    let ctx = Context::new(1024 * 1024);
    let a = filled(&ctx, 3, 1, &[1.0, 2.0, 3.0]);
    let s = ctx.new_f32(0.5);
    let out = ctx.op_scale_inplace(&a, &s);
    compute_all(&out, 1).unwrap();
    assert_eq!(out.read_f32s(), vec![0.5, 1.0, 1.5]);
}

#[test]
fn repeat_broadcasts_rows() {
    let ctx = Context::new(1024 * 1024);
    let bias = filled(&ctx, 2, 1, &[1.0, 2.0]);
    let like = filled(&ctx, 2, 3, &[0.0; 6]);
    let out = ctx.op_repeat(&bias, &like);
    compute_all(&out, 1).unwrap();
    assert_eq!(out.read_f32s(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
}

impl Tensor {
    fn idx_for_tests(&self) -> usize {
        self.idx
    }
}
