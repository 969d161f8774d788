//! Delta consistency: for every term selection, `virtual_move` must
//! equal `entropy(after) − entropy(before)` of the applied move, to
//! within rounding. This is the contract the MCMC acceptance ratio
//! rests on, so it is pinned across the whole `EntropyArgs` matrix,
//! directed and undirected, weighted and covariate-carrying graphs.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sbm_core::recs::WeightType;
use sbm_core::{BlockState, DegreeDlKind, EntropyArgs, Multigraph, StateOptions};

fn er_graph(n: usize, p: f64, directed: bool, seed: u64) -> Multigraph {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut edges = Vec::new();
    for i in 0..n {
        let lo = if directed { 0 } else { i };
        for j in lo..n {
            if i != j && rng.random::<f64>() < p {
                edges.push((i, j));
            }
        }
    }
    // a couple of parallel edges and a self-loop keep the multigraph
    // terms honest
    if !edges.is_empty() {
        edges.push(edges[0]);
    }
    edges.push((0, 0));
    Multigraph::from_edges(n, directed, &edges)
}

fn random_partition(n: usize, b: usize, seed: u64) -> Vec<usize> {
    let mut rng = SmallRng::seed_from_u64(seed);
    // every block occupied at least once
    (0..n).map(|v| if v < b { v } else { rng.random_range(0..b) }).collect()
}

fn check_moves(state: &mut BlockState, ea: &EntropyArgs, n_moves: usize, seed: u64) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let n = state.g.num_vertices();
    for step in 0..n_moves {
        let v = rng.random_range(0..n);
        let r = state.b[v];
        let nr = rng.random_range(0..state.num_blocks());

        let before = state.entropy(ea, &[], false).unwrap();
        let ds = state.virtual_move(v, r, nr, ea, &mut []).unwrap();
        if !ds.is_finite() {
            continue;
        }
        state.move_vertex(v, nr, &mut []).unwrap();
        let after = state.entropy(ea, &[], false).unwrap();

        let tol = 1e-8 * before.abs().max(1.);
        assert!(
            (ds - (after - before)).abs() < tol,
            "step {}: v={} {}->{}: delta {:.12} vs {:.12}",
            step,
            v,
            r,
            nr,
            ds,
            after - before
        );
        assert!(state.check_edge_counts(true, &[]));
        assert!(state.check_node_counts());
    }
}

fn base_state(directed: bool, deg_corr: bool, seed: u64) -> BlockState {
    let g = er_graph(20, 0.25, directed, seed);
    let b = random_partition(20, 4, seed + 1);
    let opts = StateOptions {
        deg_corr,
        ..Default::default()
    };
    BlockState::new(g, b, opts)
}

#[test]
fn sparse_exact() {
    for directed in [false, true] {
        let mut s = base_state(directed, false, 7);
        check_moves(&mut s, &EntropyArgs::adjacency_only(), 60, 11);
    }
}

#[test]
fn sparse_stirling() {
    for multigraph in [false, true] {
        for directed in [false, true] {
            let mut s = base_state(directed, false, 13);
            let ea = EntropyArgs {
                exact: false,
                multigraph,
                partition_dl: false,
                degree_dl: false,
                edges_dl: false,
                recs: false,
                bfield: false,
                ..Default::default()
            };
            check_moves(&mut s, &ea, 40, 17);
        }
    }
}

#[test]
fn dense() {
    for multigraph in [false, true] {
        for directed in [false, true] {
            let mut s = base_state(directed, false, 19);
            let ea = EntropyArgs {
                dense: true,
                multigraph,
                partition_dl: false,
                degree_dl: false,
                edges_dl: false,
                recs: false,
                bfield: false,
                ..Default::default()
            };
            check_moves(&mut s, &ea, 40, 23);
        }
    }
}

#[test]
fn degree_corrected_with_all_dl_kinds() {
    for directed in [false, true] {
        for kind in [
            DegreeDlKind::Uniform,
            DegreeDlKind::Distributed,
            DegreeDlKind::Entropy,
        ] {
            let mut s = base_state(directed, true, 29);
            let ea = EntropyArgs {
                degree_dl_kind: kind,
                recs: false,
                bfield: false,
                ..Default::default()
            };
            check_moves(&mut s, &ea, 40, 31);
        }
    }
}

#[test]
fn partition_and_edges_dl_only() {
    let mut s = base_state(false, false, 37);
    let ea = EntropyArgs {
        adjacency: false,
        partition_dl: true,
        degree_dl: false,
        edges_dl: true,
        recs: false,
        bfield: false,
        ..Default::default()
    };
    check_moves(&mut s, &ea, 60, 41);
}

#[test]
fn beta_dl_scales_model_terms() {
    let mut s = base_state(false, true, 43);
    let ea = EntropyArgs {
        beta_dl: 0.37,
        recs: false,
        bfield: false,
        ..Default::default()
    };
    check_moves(&mut s, &ea, 40, 47);
}

#[test]
fn vertex_and_block_count_fields() {
    let g = er_graph(15, 0.3, false, 53);
    let n = g.num_vertices();
    let mut rng = SmallRng::seed_from_u64(54);
    let bfield: Vec<Vec<f64>> = (0..n)
        .map(|_| (0..3).map(|_| rng.random::<f64>()).collect())
        .collect();
    let bcount_field: Vec<f64> = (0..6).map(|_| rng.random::<f64>()).collect();
    let opts = StateOptions {
        bfield: Some(bfield),
        bcount_field,
        ..Default::default()
    };
    let mut s = BlockState::new(g, random_partition(n, 4, 55), opts);
    let ea = EntropyArgs {
        recs: false,
        ..Default::default()
    };
    check_moves(&mut s, &ea, 60, 59);
}

#[test]
fn normal_edge_covariates() {
    let g = er_graph(15, 0.3, false, 61);
    let mut rng = SmallRng::seed_from_u64(62);
    let rec: Vec<f64> = (0..g.edge_bound()).map(|_| rng.random::<f64>() * 2. - 1.).collect();
    let opts = StateOptions {
        rec_types: vec![WeightType::RealNormal],
        rec: vec![rec],
        drec: vec![vec![0.; g.edge_bound()]],
        wparams: vec![vec![0., 1., 1., 1.]],
        epsilon: vec![1e-6],
        ..Default::default()
    };
    let n = g.num_vertices();
    let mut s = BlockState::new(g, random_partition(n, 3, 63), opts);
    let ea = EntropyArgs {
        bfield: false,
        ..Default::default()
    };
    check_moves(&mut s, &ea, 50, 67);
}

#[test]
fn weighted_graph() {
    let g = er_graph(15, 0.3, false, 71);
    let mut rng = SmallRng::seed_from_u64(72);
    let ew: Vec<i64> = (0..g.edge_bound()).map(|_| rng.random_range(1..4)).collect();
    let opts = StateOptions {
        eweight: Some(ew),
        deg_corr: true,
        ..Default::default()
    };
    let n = g.num_vertices();
    let mut s = BlockState::new(g, random_partition(n, 3, 73), opts);
    let ea = EntropyArgs {
        recs: false,
        bfield: false,
        ..Default::default()
    };
    check_moves(&mut s, &ea, 40, 79);
}

#[test]
fn moves_into_fresh_empty_block() {
    let mut s = base_state(false, true, 83);
    let ea = EntropyArgs {
        recs: false,
        bfield: false,
        ..Default::default()
    };
    let nr = s.add_block(1, &mut []);
    let before = s.entropy(&ea, &[], false).unwrap();
    let v = 3;
    let r = s.b[v];
    let ds = s.virtual_move(v, r, nr, &ea, &mut []).unwrap();
    s.move_vertex(v, nr, &mut []).unwrap();
    let after = s.entropy(&ea, &[], false).unwrap();
    assert!((ds - (after - before)).abs() < 1e-8 * before.abs().max(1.));
    assert!(s.candidate_groups.contains(nr));
}
