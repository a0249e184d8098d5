// Property-based tests for compiler invariants.
//
// Four categories:
// 1. Traversal order: generated DAGs yield every node once, producers first
// 2. Affine algebra: composition is associative and matches the closed form
// 3. Slot minimality: fused chains need no temporaries, materialized chains
//    never more than two
// 4. Fused semantics: compiled procedures agree with the graph interpreter
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::HashSet;

use modelc::affine::AffineOp;
use modelc::graph::Graph;
use modelc::id::NodeId;
use modelc::node::{BinaryOp, NodeKind};
use modelc::pipeline::{compile, CompileOptions};
use modelc::port::PortElements;
use modelc::transform::Transformer;
use proptest::prelude::*;

// ── Generators ──────────────────────────────────────────────────────────────

/// Small multiples of 0.5: products and sums of a few of them are exact.
fn arb_param() -> impl Strategy<Value = f64> {
    (-8i32..=8).prop_map(|v| f64::from(v) * 0.5)
}

fn arb_affine() -> impl Strategy<Value = AffineOp> {
    (arb_param(), arb_param()).prop_map(|(a, b)| AffineOp::new(a, b))
}

fn arb_affine_kind() -> impl Strategy<Value = NodeKind> {
    prop_oneof![
        arb_param().prop_map(|f| NodeKind::Scale { factors: vec![f] }),
        arb_param().prop_map(|o| NodeKind::Shift { offsets: vec![o] }),
        (arb_param(), arb_param()).prop_map(|(s, b)| NodeKind::ScaleShift {
            scale: vec![s],
            shift: vec![b],
        }),
    ]
}

/// Each step reads one or two earlier nodes, chosen by index.
#[derive(Debug, Clone)]
struct Step {
    first: prop::sample::Index,
    second: prop::sample::Index,
    binary: bool,
}

fn arb_dag_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (any::<prop::sample::Index>(), any::<prop::sample::Index>(), any::<bool>()).prop_map(
            |(first, second, binary)| Step {
                first,
                second,
                binary,
            },
        ),
        0..24,
    )
}

fn build_dag(steps: &[Step]) -> Graph {
    let mut g = Graph::new();
    let mut ids = vec![g.add_node(NodeKind::Input { size: 2 }, vec![]).unwrap()];
    for step in steps {
        let a = ids[step.first.index(ids.len())];
        let id = if step.binary {
            let b = ids[step.second.index(ids.len())];
            g.add_node(
                NodeKind::Binary { op: BinaryOp::Add },
                vec![PortElements::full(a, 2), PortElements::full(b, 2)],
            )
            .unwrap()
        } else {
            g.add_node(NodeKind::Scale { factors: vec![2.0] }, vec![PortElements::full(a, 2)])
                .unwrap()
        };
        ids.push(id);
    }
    g
}

fn chain(kinds: &[NodeKind], size: usize) -> (Graph, Vec<PortElements>) {
    let mut g = Graph::new();
    let mut prev = g.add_node(NodeKind::Input { size }, vec![]).unwrap();
    for kind in kinds {
        prev = g
            .add_node(kind.clone(), vec![PortElements::full(prev, size)])
            .unwrap();
    }
    (g, vec![PortElements::full(prev, size)])
}

// ── 1. Traversal order ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn traversal_yields_each_node_once_after_its_producers(steps in arb_dag_steps()) {
        let g = build_dag(&steps);
        let mut seen: HashSet<NodeId> = HashSet::new();
        for node in g.iter() {
            prop_assert!(seen.insert(node.id()), "node {} yielded twice", node.id());
            for p in node.producers() {
                prop_assert!(seen.contains(&p), "node {} before its producer {}", node.id(), p);
            }
        }
        prop_assert_eq!(seen.len(), g.len());
    }

    #[test]
    fn copy_preserves_node_count(steps in arb_dag_steps()) {
        let g = build_dag(&steps);
        let copy = Transformer::new().copy_graph(&g).unwrap();
        prop_assert_eq!(copy.len(), g.len());
        let tags = |g: &Graph| g.iter().map(|n| n.tag()).collect::<Vec<_>>();
        prop_assert_eq!(tags(&copy), tags(&g));
    }

    #[test]
    fn submodel_contains_only_producers(steps in arb_dag_steps(), goal in any::<prop::sample::Index>()) {
        let g = build_dag(&steps);
        let goal = NodeId(goal.index(g.len()) as u32);
        let expected = g.iter_from(&[goal]).unwrap().count();
        let size = g.node(goal).unwrap().size();
        let sub = Transformer::new()
            .copy_submodel(&g, &[PortElements::full(goal, size)])
            .unwrap();
        prop_assert_eq!(sub.len(), expected);
        prop_assert!(sub.len() <= g.len());
    }
}

// ── 2. Affine algebra ───────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 500,
        .. ProptestConfig::default()
    })]

    #[test]
    fn compound_is_associative(f in arb_affine(), g in arb_affine(), h in arb_affine()) {
        let left = f.compound(&g).compound(&h);
        let right = f.compound(&g.compound(&h));
        prop_assert_eq!(left, right);
        let (a1, b1) = (f.multiply_by(), f.increment_by());
        let (a2, b2) = (g.multiply_by(), g.increment_by());
        let (a3, b3) = (h.multiply_by(), h.increment_by());
        prop_assert_eq!(
            left,
            AffineOp::new(a1 * a2 * a3, a1 * a2 * b3 + a1 * b2 + b1)
        );
    }

    #[test]
    fn compound_applies_source_first(f in arb_affine(), g in arb_affine(), x in arb_param()) {
        prop_assert_eq!(f.compound(&g).apply(x), f.apply(g.apply(x)));
    }
}

// ── 3. Slot minimality ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn fused_chain_needs_no_temporaries(
        kinds in prop::collection::vec(arb_affine_kind(), 1..12),
        size in 1usize..4,
    ) {
        let (g, outputs) = chain(&kinds, size);
        let generated = compile(g, outputs, &CompileOptions::default()).unwrap();
        prop_assert_eq!(generated.stats.temp_slots, 0);
        prop_assert_eq!(generated.stats.declares, 0);
        // One statement per element, whether computed or zero-filled.
        prop_assert_eq!(generated.stats.sets, size);
    }

    #[test]
    fn materialized_chain_reuses_two_slots(
        kinds in prop::collection::vec(arb_affine_kind(), 1..12),
        size in 1usize..4,
    ) {
        let (g, outputs) = chain(&kinds, size);
        let options = CompileOptions { fuse: false, ..CompileOptions::default() };
        let generated = compile(g, outputs, &options).unwrap();
        prop_assert_eq!(generated.stats.temp_slots, kinds.len().min(2));
        prop_assert_eq!(generated.stats.declares, kinds.len().min(2));
    }
}

// ── 4. Fused semantics ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn compiled_chain_matches_interpreter(
        kinds in prop::collection::vec(arb_affine_kind(), 0..10),
        inputs in prop::collection::vec(arb_param(), 3),
        fuse in any::<bool>(),
        fold_affine in any::<bool>(),
    ) {
        let (g, outputs) = chain(&kinds, 3);
        let expected = g.evaluate(&inputs, &outputs).unwrap();
        let options = CompileOptions { fuse, fold_affine, ..CompileOptions::default() };
        let procedure = compile(g, outputs, &options).unwrap().procedure;
        let actual = procedure.run(&inputs).unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            prop_assert!((a - e).abs() <= 1e-9 * e.abs().max(1.0), "{:?} != {:?}", actual, expected);
        }
    }
}
