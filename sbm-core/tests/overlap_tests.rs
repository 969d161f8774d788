//! Overlapping (half-edge) state: node-based block sizes, half-edge
//! moves, delta consistency and the unsupported dense formulation.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sbm_core::{EntropyArgs, Multigraph, OverlapBlockState, OverlapOptions, StateError};

fn triangle_overlap() -> OverlapBlockState {
    let g = Multigraph::from_edges(3, false, &[(0, 1), (1, 2), (2, 0)]);
    OverlapBlockState::from_node_graph(&g, &[0, 0, 1], OverlapOptions::default())
}

#[test]
fn half_edge_expansion_shape() {
    let s = triangle_overlap();
    // three edges, two half-edges each
    assert_eq!(s.g.num_vertices(), 6);
    assert_eq!(s.g.num_edges(), 3);
    assert_eq!(s.get_n(), 3);
    // every half-edge touches exactly one edge
    for v in s.g.vertices() {
        assert_eq!(s.g.total_degree(v), 1);
    }
    assert!(s.check_edge_counts(true, &[]));
    assert!(s.check_node_counts());
}

#[test]
fn block_sizes_count_nodes() {
    // node 0 and 1 label all their half-edges 0; node 2 labels its two
    // half-edges 1
    let s = triangle_overlap();
    assert_eq!(s.wr[0], 2);
    assert_eq!(s.wr[1], 1);
}

#[test]
fn split_node_membership() {
    // moving one of node 2's half-edges into block 0 makes node 2
    // belong to both blocks
    let mut s = triangle_overlap();
    let hv = (0..s.g.num_vertices())
        .find(|&v| s.overlap_stats.get_node(v) == 2)
        .unwrap();
    s.move_vertex(hv, 0, &mut []).unwrap();
    assert_eq!(s.wr[0], 3, "node 2 now represented in block 0");
    assert_eq!(s.wr[1], 1, "node 2 still represented in block 1");
    assert!(s.check_node_counts());
    assert!(s.check_edge_counts(true, &[]));
}

#[test]
fn virtual_remove_size_semantics() {
    let s = triangle_overlap();
    let hv2: Vec<usize> = (0..s.g.num_vertices())
        .filter(|&v| s.overlap_stats.get_node(v) == 2)
        .collect();
    // node 2 has two half-edges in block 1: removing one keeps it there
    assert_eq!(s.overlap_stats.virtual_remove_size(hv2[0], 1), 1);
    // a node-0 half-edge leaving block 0 still leaves node 0 and 1 there
    let hv0 = (0..s.g.num_vertices())
        .find(|&v| s.overlap_stats.get_node(v) == 0)
        .unwrap();
    assert_eq!(s.overlap_stats.virtual_remove_size(hv0, 0), 2);
}

#[test]
fn dense_formulation_is_not_supported() {
    let mut s = triangle_overlap();
    let ea = EntropyArgs {
        dense: true,
        ..Default::default()
    };
    assert!(matches!(
        s.entropy(&ea, &[], false),
        Err(StateError::NotSupported(_))
    ));
    assert!(matches!(
        s.virtual_move(0, s.b[0], 1, &ea, &mut []),
        Err(StateError::NotSupported(_))
    ));
}

fn overlap_state(seed: u64, deg_corr: bool) -> OverlapBlockState {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut edges = Vec::new();
    let n = 12;
    for i in 0..n {
        for j in (i + 1)..n {
            if rng.random::<f64>() < 0.3 {
                edges.push((i, j));
            }
        }
    }
    edges.push(edges[0]); // one parallel bundle
    let g = Multigraph::from_edges(n, false, &edges);
    let b: Vec<usize> = (0..n).map(|v| v % 3).collect();
    let opts = OverlapOptions {
        deg_corr,
        ..Default::default()
    };
    OverlapBlockState::from_node_graph(&g, &b, opts)
}

#[test]
fn overlap_delta_consistency() {
    for deg_corr in [false, true] {
        let mut s = overlap_state(31, deg_corr);
        let ea = EntropyArgs {
            recs: false,
            bfield: false,
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(37);
        let nv = s.g.num_vertices();
        for step in 0..60 {
            let v = rng.random_range(0..nv);
            let r = s.b[v];
            let nr = rng.random_range(0..s.bg.num_vertices());
            let before = s.entropy(&ea, &[], false).unwrap();
            let ds = s.virtual_move(v, r, nr, &ea, &mut []).unwrap();
            if !ds.is_finite() {
                continue;
            }
            s.move_vertex(v, nr, &mut []).unwrap();
            let after = s.entropy(&ea, &[], false).unwrap();
            assert!(
                (ds - (after - before)).abs() < 1e-8 * before.abs().max(1.),
                "deg_corr={} step {}: {:.12} vs {:.12}",
                deg_corr,
                step,
                ds,
                after - before
            );
            assert!(s.check_edge_counts(true, &[]));
            assert!(s.check_node_counts());
        }
    }
}

#[test]
fn overlap_move_round_trip() {
    let mut s = overlap_state(41, false);
    let wr0 = s.wr.clone();
    let mrs0 = s.mrs.clone();
    let v = 0;
    let r = s.b[v];
    let nr = (r + 1) % s.bg.num_vertices();
    s.move_vertex(v, nr, &mut []).unwrap();
    s.move_vertex(v, r, &mut []).unwrap();
    assert_eq!(s.wr, wr0);
    assert_eq!(s.mrs, mrs0);
}

#[test]
fn overlap_proposals_and_reverse_probability() {
    let mut s = overlap_state(43, false);
    s.init_mcmc(1.0);
    let mut rng = SmallRng::seed_from_u64(47);
    let (c, d) = (1.0, 0.01);
    let nv = s.g.num_vertices();
    let mut tested = 0;
    for _ in 0..200 {
        let v = rng.random_range(0..nv);
        let r = s.b[v];
        let nr = s.sample_block(v, c, d, &mut rng, &mut []);
        if nr == r || s.wr[nr] == 0 || s.overlap_stats.virtual_remove_size(v, r) == 0 {
            continue;
        }
        let p_rev = s.get_move_prob(v, nr, r, c, d, true);
        s.move_vertex(v, nr, &mut []).unwrap();
        let p_fwd_back = s.get_move_prob(v, nr, r, c, d, false);
        assert!(
            (p_rev - p_fwd_back).abs() < 1e-10,
            "reverse {:.12} vs forward-after {:.12}",
            p_rev,
            p_fwd_back
        );
        s.move_vertex(v, r, &mut []).unwrap();
        tested += 1;
    }
    assert!(tested > 20, "too few proposals exercised: {}", tested);
}

#[test]
fn deep_copy_independence() {
    let s = overlap_state(53, false);
    let mut s2 = s.deep_copy();
    let nr = (s.b[0] + 1) % s.bg.num_vertices();
    s2.move_vertex(0, nr, &mut []).unwrap();
    assert_ne!(s.b[0], s2.b[0]);
    assert!(s.check_edge_counts(true, &[]));
    assert!(s2.check_edge_counts(true, &[]));
}
