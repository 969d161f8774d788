//! The coupled chain: occupancy propagation, entropy of the stack and
//! delta consistency of moves that reverberate upward.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sbm_core::{BlockState, EntropyArgs, Hierarchy, Multigraph, StateOptions};

fn er_graph(n: usize, p: f64, seed: u64) -> Multigraph {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut edges = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            if rng.random::<f64>() < p {
                edges.push((i, j));
            }
        }
    }
    Multigraph::from_edges(n, false, &edges)
}

/// Entropy arguments of the levels above the base: dense multigraph
/// likelihood plus their own partition prior; the uniform edge-count
/// prior closes the chain at the top.
fn upper_ea() -> EntropyArgs {
    EntropyArgs {
        adjacency: true,
        dense: true,
        multigraph: true,
        exact: false,
        deg_entropy: false,
        partition_dl: true,
        degree_dl: false,
        edges_dl: true,
        recs: false,
        bfield: false,
        beta_dl: 1.,
        ..Default::default()
    }
}

fn base_ea() -> EntropyArgs {
    EntropyArgs {
        adjacency: true,
        dense: false,
        multigraph: true,
        exact: true,
        deg_entropy: true,
        partition_dl: true,
        degree_dl: false,
        edges_dl: false,
        recs: false,
        bfield: false,
        beta_dl: 1.,
        ..Default::default()
    }
}

fn two_level(seed: u64) -> Hierarchy {
    let g = er_graph(8, 0.5, seed);
    let b = vec![0, 0, 1, 1, 2, 2, 3, 3];
    let state = BlockState::new(g, b, StateOptions::default());
    let mut h = Hierarchy::from_block(state);
    h.couple_state(vec![0, 0, 1, 1], upper_ea(), StateOptions::default());
    h
}

#[test]
fn upper_level_mirrors_block_graph() {
    let h = two_level(3);
    let base = h.base_block().unwrap();
    let up = &h.upper[0];
    assert_eq!(up.g.num_vertices(), base.bg.num_vertices());
    assert_eq!(up.g.num_edges(), base.bg.num_edges());
    for me in base.bg.edges() {
        assert_eq!(up.eweight[me], base.mrs[me]);
    }
    assert_eq!(up.vweight, vec![1, 1, 1, 1]);
    assert!(h.check_edge_counts());
    assert!(h.check_node_counts());
}

#[test]
fn emptying_a_block_collapses_upward() {
    // drain lower block 0 into block 1
    let mut h = two_level(5);
    h.move_vertex(0, 1).unwrap();
    assert_eq!(h.upper[0].vweight[0], 1, "block 0 still occupied");
    h.move_vertex(1, 1).unwrap();

    let up = &h.upper[0];
    assert_eq!(up.vweight[0], 0, "vacated block loses upper weight");
    assert_eq!(up.wr[up.b[0]], 1, "upper group shrank");
    let base = h.base_block().unwrap();
    assert!(base.empty_groups.contains(0));
    assert!(h.check_edge_counts());
    assert!(h.check_node_counts());
}

#[test]
fn propagated_entropy_is_the_sum_of_levels() {
    let h = two_level(7);
    let base = h.base_block().unwrap();
    let s0 = base.entropy(&base_ea(), &[], false).unwrap();
    let s1 = h.upper[0].entropy(&upper_ea(), &[], false).unwrap();
    let total = h.entropy(&base_ea(), true).unwrap();
    assert!(
        (total - (s0 + s1)).abs() < 1e-10,
        "{} vs {} + {}",
        total,
        s0,
        s1
    );
}

#[test]
fn coupled_delta_consistency() {
    let mut h = two_level(11);
    let ea = base_ea();
    let mut rng = SmallRng::seed_from_u64(13);
    let n = match &h.base {
        sbm_core::BaseState::Block(s) => s.g.num_vertices(),
        _ => unreachable!(),
    };
    let mut checked = 0;
    for step in 0..80 {
        let v = rng.random_range(0..n);
        let r = match &h.base {
            sbm_core::BaseState::Block(s) => s.b[v],
            _ => unreachable!(),
        };
        let nr = rng.random_range(0..h.base_block().unwrap().num_blocks());

        let before = h.entropy(&ea, true).unwrap();
        let ds = h.virtual_move(v, r, nr, &ea).unwrap();
        if !ds.is_finite() {
            continue;
        }
        h.move_vertex(v, nr).unwrap();
        let after = h.entropy(&ea, true).unwrap();
        let tol = 1e-8 * before.abs().max(1.);
        assert!(
            (ds - (after - before)).abs() < tol,
            "step {}: v={} {}->{}: {:.12} vs {:.12}",
            step,
            v,
            r,
            nr,
            ds,
            after - before
        );
        assert!(h.check_edge_counts());
        assert!(h.check_node_counts());
        checked += 1;
    }
    assert!(checked > 20, "too few admissible moves exercised");
}

#[test]
fn three_level_stack() -> anyhow::Result<()> {
    let g = er_graph(12, 0.4, 17);
    let b = (0..12).map(|v| v / 2).collect::<Vec<_>>();
    let state = BlockState::new(g, b, StateOptions::default());
    let mut h = Hierarchy::from_block(state);
    h.couple_state(vec![0, 0, 1, 1, 2, 2], upper_ea(), StateOptions::default());
    h.couple_state(vec![0, 0, 1], upper_ea(), StateOptions::default());
    assert_eq!(h.depth(), 3);

    let ea = base_ea();
    let mut rng = SmallRng::seed_from_u64(19);
    for _ in 0..40 {
        let v = rng.random_range(0..12);
        let r = h.base_block().unwrap().b[v];
        let nr = rng.random_range(0..h.base_block().unwrap().num_blocks());
        let before = h.entropy(&ea, true)?;
        let ds = h.virtual_move(v, r, nr, &ea)?;
        if !ds.is_finite() {
            continue;
        }
        h.move_vertex(v, nr)?;
        let after = h.entropy(&ea, true)?;
        assert!(
            (ds - (after - before)).abs() < 1e-8 * before.abs().max(1.),
            "{} vs {}",
            ds,
            after - before
        );
    }
    assert!(h.check_edge_counts());
    Ok(())
}

#[test]
fn deep_copy_chain_is_independent() {
    let h = two_level(23);
    let b0 = h.base_block().unwrap().b.clone();
    let wr0 = h.base_block().unwrap().wr.clone();
    let mrs0 = h.base_block().unwrap().mrs.clone();
    let up_w0 = h.upper[0].vweight.clone();

    let mut h2 = h.deep_copy();
    h2.move_vertex(0, 3).unwrap();

    assert_eq!(h.base_block().unwrap().b, b0);
    assert_eq!(h.base_block().unwrap().wr, wr0);
    assert_eq!(h.base_block().unwrap().mrs, mrs0);
    assert_eq!(h.upper[0].vweight, up_w0);
    assert!(h2.check_edge_counts());
    assert!(h.check_edge_counts());
}

#[test]
fn barrier_propagates_from_upper_level() {
    let g = er_graph(8, 0.5, 29);
    let b = vec![0, 0, 1, 1, 2, 2, 3, 3];
    let state = BlockState::new(g, b, StateOptions::default());
    let mut h = Hierarchy::from_block(state);
    let opts = StateOptions {
        bclabel: Some(vec![0, 1]),
        ..Default::default()
    };
    h.couple_state(vec![0, 0, 1, 1], upper_ea(), opts);

    // blocks 0 and 2 sit in different upper groups with different labels
    let v = 0;
    assert!(h.move_vertex(v, 2).is_err());
    let ds = h.virtual_move(v, 0, 2, &base_ea()).unwrap();
    assert!(ds.is_infinite());
    // moves within the same upper group stay legal
    assert!(h.move_vertex(v, 1).is_ok());
}
