//! End-to-end planning scenarios.
//!
//! Each test builds a small catalog, runs the planner, and checks the
//! shape of the chosen plan: join order, index choices, scan directions,
//! and the ORDER BY / DISTINCT flags.

use lodestone_ast::{CompareOp, Expr, InSet, LikeKind, OrderingTerm, Span};
use lodestone_planner::catalog::{
    Column, FromItem, Index, IndexColumn, IndexKind, JoinKind, Table, TableKind,
};
use lodestone_planner::plan::{DistinctMode, ScanPlan, WherePlan};
use lodestone_planner::vtab::{BestIndexInfo, VirtualTable};
use lodestone_planner::{plan, term_ops as wo, PlanError, PlannerOptions, WhereInput};
use lodestone_types::{Bitmask, CursorId};

// ---------------------------------------------------------------------------
// Catalog helpers
// ---------------------------------------------------------------------------

/// A table with an implicit-key primary index, like a plain rowid table.
fn rowid_table(name: &str, columns: Vec<Column>, rows: u64) -> Table {
    let mut t = Table::btree(name, columns, rows);
    t.indexes.push(
        Index::new(
            format!("{name}_pk"),
            IndexKind::PrimaryKey,
            vec![IndexColumn::asc(-1)],
        )
        .with_row_est(vec![rows, 1]),
    );
    t
}

fn eq(cursor: i32, col: i32, v: i64) -> Expr {
    Expr::compare(
        CompareOp::Eq,
        Expr::column(CursorId(cursor), col),
        Expr::integer(v),
    )
}

fn planned(input: &WhereInput<'_>) -> WherePlan {
    plan(input, &PlannerOptions::default()).expect("plan")
}

// ---------------------------------------------------------------------------
// Scenario A: index selection with equality and range
// ---------------------------------------------------------------------------

#[test]
fn equality_and_range_drive_the_index() {
    let mut t1 = rowid_table(
        "t1",
        vec![Column::numeric("a"), Column::numeric("b"), Column::numeric("c")],
        10_000,
    );
    t1.indexes.push(
        Index::new(
            "i",
            IndexKind::Plain,
            vec![IndexColumn::asc(0), IndexColumn::asc(1)],
        )
        .with_row_est(vec![10_000, 100, 10]),
    );

    // a=5 AND b>2 AND b<10
    let w = Expr::and(
        eq(0, 0, 5),
        Expr::and(
            Expr::compare(CompareOp::Gt, Expr::column(CursorId(0), 1), Expr::integer(2)),
            Expr::compare(CompareOp::Lt, Expr::column(CursorId(0), 1), Expr::integer(10)),
        ),
    );
    let input = WhereInput::new(vec![FromItem::new(&t1, CursorId(0))], Some(&w));
    let p = planned(&input);

    assert_eq!(p.levels.len(), 1);
    let ScanPlan::IndexScan {
        index_name,
        n_eq,
        range_btm,
        range_top,
        covering,
        ..
    } = &p.levels[0].scan
    else {
        panic!("expected an index scan, got {:?}", p.levels[0].scan);
    };
    assert_eq!(index_name, "i");
    assert_eq!(*n_eq, 1);
    assert!(!*covering, "c is read, so the scan cannot be index-only");
    assert!(!p.levels[0].reversed);

    let btm = range_btm.expect("bottom bound");
    let top = range_top.expect("top bound");
    assert!(p.clauses.term(btm).e_operator & wo::GT != 0);
    assert!(p.clauses.term(top).e_operator & wo::LT != 0);
}

// ---------------------------------------------------------------------------
// Scenario B: two-table join with ORDER BY satisfied
// ---------------------------------------------------------------------------

fn keyed_table(name: &str, key: &str, other: &str, rows: u64) -> Table {
    let mut t = Table::btree(
        name,
        vec![Column::numeric(key).not_null(), Column::numeric(other)],
        rows,
    );
    t.indexes.push(
        Index::new(
            format!("{name}_pk"),
            IndexKind::PrimaryKey,
            vec![IndexColumn::asc(0)],
        )
        .with_row_est(vec![rows, 1]),
    );
    t
}

#[test]
fn join_order_satisfies_order_by_without_sorting() {
    let t1 = keyed_table("t1", "x", "y", 1000);
    let t2 = keyed_table("t2", "p", "q", 1000);

    // FROM t1 JOIN t2 ON t1.x = t2.p ORDER BY t1.x
    let w = Expr::compare(
        CompareOp::Eq,
        Expr::column(CursorId(0), 0),
        Expr::column(CursorId(1), 0),
    );
    let ob = [OrderingTerm::asc(Expr::column(CursorId(0), 0))];
    let mut input = WhereInput::new(
        vec![
            FromItem::new(&t1, CursorId(0)),
            FromItem::new(&t2, CursorId(1)),
        ],
        Some(&w),
    );
    input.order_by = Some(&ob);
    let p = planned(&input);

    assert_eq!(p.levels.len(), 2);
    assert_eq!(p.levels[0].from_pos, 0, "t1 drives the join");
    let ScanPlan::IndexScan { n_eq, .. } = &p.levels[0].scan else {
        panic!("outer loop should walk the t1 primary key");
    };
    assert_eq!(*n_eq, 0);
    let ScanPlan::IndexScan { n_eq, one_row, .. } = &p.levels[1].scan else {
        panic!("inner loop should probe the t2 primary key");
    };
    assert_eq!(*n_eq, 1);
    assert!(*one_row);
    assert!(p.order_by_satisfied, "no sort pass needed");
    assert_eq!(p.rev_mask, Bitmask::EMPTY);
}

#[test]
fn order_by_desc_reverses_the_scan() {
    let t1 = keyed_table("t1", "x", "y", 1000);
    let ob = [OrderingTerm::desc(Expr::column(CursorId(0), 0))];
    let mut input = WhereInput::new(vec![FromItem::new(&t1, CursorId(0))], None);
    input.order_by = Some(&ob);
    let p = planned(&input);
    assert!(p.order_by_satisfied);
    assert!(p.levels[0].reversed);
}

// ---------------------------------------------------------------------------
// Scenario C: OR decomposed to IN
// ---------------------------------------------------------------------------

#[test]
fn or_of_equalities_plans_as_in() {
    let mut t = rowid_table("t", vec![Column::numeric("x"), Column::numeric("y")], 10_000);
    t.indexes.push(
        Index::new("tx", IndexKind::Plain, vec![IndexColumn::asc(0)])
            .with_row_est(vec![10_000, 3]),
    );

    let x = || Expr::column(CursorId(0), 0);
    let w = Expr::or(
        Expr::or(
            Expr::compare(CompareOp::Eq, x(), Expr::integer(1)),
            Expr::compare(CompareOp::Eq, x(), Expr::integer(2)),
        ),
        Expr::compare(CompareOp::Eq, x(), Expr::integer(7)),
    );
    let input = WhereInput::new(vec![FromItem::new(&t, CursorId(0))], Some(&w));
    let p = planned(&input);

    let ScanPlan::IndexScan { index_name, n_eq, .. } = &p.levels[0].scan else {
        panic!("expected the IN rewrite to drive tx, got {:?}", p.levels[0].scan);
    };
    assert_eq!(index_name, "tx");
    assert_eq!(*n_eq, 1);
    let consumed = &p.levels[0].consumed_terms;
    assert_eq!(consumed.len(), 1);
    let in_term = p.clauses.term(consumed[0]);
    assert!(in_term.e_operator & wo::IN != 0);
    let Expr::In { set: InSet::List(items), .. } = &in_term.expr else {
        panic!("consumed term should be the synthesized IN");
    };
    assert_eq!(items.len(), 3);
    // The original OR term was retired, not deleted.
    let noop = p
        .clauses
        .clause(p.main_clause)
        .terms
        .iter()
        .filter(|t| t.e_operator == wo::NOOP)
        .count();
    assert_eq!(noop, 1);
}

// ---------------------------------------------------------------------------
// Scenario D: LIKE prefix
// ---------------------------------------------------------------------------

#[test]
fn like_prefix_becomes_a_nocase_range() {
    let mut t = rowid_table("people", vec![Column::text("name")], 50_000);
    t.indexes.push({
        let mut ix = Index::new(
            "people_name",
            IndexKind::Plain,
            vec![IndexColumn {
                column: 0,
                collation: "NOCASE".to_owned(),
                sort_order: lodestone_ast::SortOrder::Asc,
            }],
        );
        ix.row_est = vec![50_000, 5];
        ix
    });

    let w = Expr::Like {
        kind: LikeKind::Like,
        lhs: Box::new(Expr::column(CursorId(0), 0)),
        pattern: Box::new(Expr::string("abc%")),
        escape: None,
        span: Span::ZERO,
    };
    let input = WhereInput::new(vec![FromItem::new(&t, CursorId(0))], Some(&w));
    let p = planned(&input);

    let ScanPlan::IndexScan {
        index_name,
        n_eq,
        range_btm,
        range_top,
        ..
    } = &p.levels[0].scan
    else {
        panic!("expected a range scan of people_name, got {:?}", p.levels[0].scan);
    };
    assert_eq!(index_name, "people_name");
    assert_eq!(*n_eq, 0);

    // name >= 'abc' AND name < 'abd', both collated NOCASE.
    let check_bound = |tr, expect: &str| {
        let term = p.clauses.term(tr);
        let Expr::Compare { left, right, .. } = &term.expr else {
            panic!("range bound is a comparison");
        };
        assert!(matches!(&**left, Expr::Collate { collation, .. } if collation == "NOCASE"));
        let Expr::Literal(lodestone_ast::Literal::String(s), _) = &**right else {
            panic!("range bound against a string literal");
        };
        assert_eq!(s, expect);
    };
    check_bound(range_btm.expect("bottom"), "abc");
    check_bound(range_top.expect("top"), "abd");

    // The original LIKE stays behind as a residue filter.
    let residue = p.residue_terms();
    assert!(residue
        .iter()
        .any(|&tr| matches!(p.clauses.term(tr).expr, Expr::Like { .. })));
}

// ---------------------------------------------------------------------------
// Scenario E: automatic index
// ---------------------------------------------------------------------------

#[test]
fn join_without_indexes_builds_an_automatic_index() {
    let t1 = Table::btree("t1", vec![Column::numeric("a")], 10_000);
    let t2 = Table::btree("t2", vec![Column::numeric("b")], 10_000);

    let w = Expr::compare(
        CompareOp::Eq,
        Expr::column(CursorId(0), 0),
        Expr::column(CursorId(1), 0),
    );
    let input = WhereInput::new(
        vec![
            FromItem::new(&t1, CursorId(0)),
            FromItem::new(&t2, CursorId(1)),
        ],
        Some(&w),
    );
    let p = planned(&input);

    assert_eq!(p.levels.len(), 2);
    assert!(
        matches!(p.levels[0].scan, ScanPlan::FullScan),
        "outer loop scans"
    );
    let ScanPlan::AutoIndex { descriptor } = &p.levels[1].scan else {
        panic!("inner loop should build a transient index, got {:?}", p.levels[1].scan);
    };
    assert_eq!(descriptor.eq_columns, vec![0]);
    // Covering: the one remaining column is already the key.
    assert!(descriptor.extra_columns.is_empty());

    // With the knob off, the inner loop falls back to a scan.
    let opts = PlannerOptions {
        auto_index: false,
        ..PlannerOptions::default()
    };
    let p2 = plan(&input, &opts).expect("plan");
    assert!(matches!(p2.levels[1].scan, ScanPlan::FullScan));
}

// ---------------------------------------------------------------------------
// Scenario F: DISTINCT redundant
// ---------------------------------------------------------------------------

#[test]
fn distinct_over_a_unique_key_is_redundant() {
    let mut t = rowid_table(
        "t",
        vec![Column::numeric("a").not_null(), Column::numeric("b")],
        1000,
    );
    t.indexes.push(
        Index::new("ta", IndexKind::Unique, vec![IndexColumn::asc(0)])
            .with_row_est(vec![1000, 1]),
    );

    let rs = [Expr::column(CursorId(0), 0), Expr::column(CursorId(0), 1)];
    let mut input = WhereInput::new(vec![FromItem::new(&t, CursorId(0))], None);
    input.result_set = Some(&rs);
    input.want_distinct = true;
    let p = planned(&input);
    assert_eq!(p.distinct, DistinctMode::Unique);

    // Without the unique column in the projection the reduction fails.
    let rs2 = [Expr::column(CursorId(0), 1)];
    let mut input2 = WhereInput::new(vec![FromItem::new(&t, CursorId(0))], None);
    input2.result_set = Some(&rs2);
    input2.want_distinct = true;
    let p2 = planned(&input2);
    assert_ne!(p2.distinct, DistinctMode::Unique);
}

// ---------------------------------------------------------------------------
// LEFT JOIN: ON terms may not drive left-table indexes
// ---------------------------------------------------------------------------

#[test]
fn left_join_on_term_never_drives_a_left_table_index() {
    let mut t1 = rowid_table("t1", vec![Column::numeric("a")], 10_000);
    t1.indexes.push(
        Index::new("t1a", IndexKind::Plain, vec![IndexColumn::asc(0)])
            .with_row_est(vec![10_000, 2]),
    );
    let t2 = rowid_table("t2", vec![Column::numeric("b")], 10);

    // t1 LEFT JOIN t2 ON t1.a = t2.b: the ON term would love to probe
    // t1a, but may not.
    let w = Expr::compare(
        CompareOp::Eq,
        Expr::column(CursorId(0), 0),
        Expr::column(CursorId(1), 0),
    )
    .from_join(CursorId(1));
    let input = WhereInput::new(
        vec![
            FromItem::new(&t1, CursorId(0)),
            FromItem::new(&t2, CursorId(1)).with_join(JoinKind::Left),
        ],
        Some(&w),
    );
    let p = planned(&input);

    assert_eq!(p.levels[0].from_pos, 0, "LEFT JOIN fixes the table order");
    match &p.levels[0].scan {
        ScanPlan::IndexScan { n_eq, .. } => assert_eq!(*n_eq, 0),
        ScanPlan::FullScan => {}
        other => panic!("t1 must be scanned, not probed: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Idempotence and input-order insensitivity
// ---------------------------------------------------------------------------

fn range_query_fixture() -> Table {
    let mut t1 = rowid_table(
        "t1",
        vec![Column::numeric("a"), Column::numeric("b"), Column::numeric("c")],
        10_000,
    );
    t1.indexes.push(
        Index::new(
            "i",
            IndexKind::Plain,
            vec![IndexColumn::asc(0), IndexColumn::asc(1)],
        )
        .with_row_est(vec![10_000, 100, 10]),
    );
    t1
}

#[test]
fn replanning_is_deterministic() {
    let t1 = range_query_fixture();
    let w = Expr::and(
        eq(0, 0, 5),
        Expr::compare(CompareOp::Gt, Expr::column(CursorId(0), 1), Expr::integer(2)),
    );
    let input = WhereInput::new(vec![FromItem::new(&t1, CursorId(0))], Some(&w));
    let a = planned(&input);
    let input2 = WhereInput::new(vec![FromItem::new(&t1, CursorId(0))], Some(&w));
    let b = planned(&input2);
    assert_eq!(a.levels, b.levels);
    assert_eq!(a.rev_mask, b.rev_mask);
    assert_eq!(a.order_by_satisfied, b.order_by_satisfied);
}

#[test]
fn tautology_does_not_change_the_plan() {
    let t1 = range_query_fixture();
    let w = Expr::and(
        eq(0, 0, 5),
        Expr::compare(CompareOp::Gt, Expr::column(CursorId(0), 1), Expr::integer(2)),
    );
    let w_taut = Expr::and(
        w.clone(),
        Expr::compare(CompareOp::Eq, Expr::integer(1), Expr::integer(1)),
    );
    let fi = || vec![FromItem::new(&t1, CursorId(0))];
    let a = planned(&WhereInput::new(fi(), Some(&w)));
    let b = planned(&WhereInput::new(fi(), Some(&w_taut)));
    let scan_of = |p: &WherePlan| match &p.levels[0].scan {
        ScanPlan::IndexScan { index_name, n_eq, .. } => (index_name.clone(), *n_eq),
        other => panic!("unexpected scan {other:?}"),
    };
    assert_eq!(scan_of(&a), scan_of(&b));
}

#[test]
fn conjunct_order_does_not_change_the_plan() {
    let t1 = range_query_fixture();
    let c1 = eq(0, 0, 5);
    let c2 = Expr::compare(CompareOp::Gt, Expr::column(CursorId(0), 1), Expr::integer(2));
    let fi = || vec![FromItem::new(&t1, CursorId(0))];
    let ab = Expr::and(c1.clone(), c2.clone());
    let ba = Expr::and(c2, c1);
    let a = planned(&WhereInput::new(fi(), Some(&ab)));
    let b = planned(&WhereInput::new(fi(), Some(&ba)));
    let fia = fi();
    let fib = fi();
    assert_eq!(
        format!("{}", a.summary(&fia)),
        format!("{}", b.summary(&fib))
    );
}

// ---------------------------------------------------------------------------
// Boundary cases
// ---------------------------------------------------------------------------

#[test]
fn empty_in_list_still_plans() {
    let mut t = rowid_table("t", vec![Column::numeric("x")], 1000);
    t.indexes.push(
        Index::new("tx", IndexKind::Plain, vec![IndexColumn::asc(0)])
            .with_row_est(vec![1000, 2]),
    );
    let w = Expr::In {
        lhs: Box::new(Expr::column(CursorId(0), 0)),
        set: InSet::List(Vec::new()),
        span: Span::ZERO,
    };
    let input = WhereInput::new(vec![FromItem::new(&t, CursorId(0))], Some(&w));
    let p = planned(&input);
    assert_eq!(p.levels.len(), 1);
}

#[test]
fn indexed_by_forbidding_everything_is_reported() {
    // With INDEXED BY, the forced index is the only candidate and the
    // full scan is off the table; an index that cannot ever be the only
    // access path still plans (full scans of the forced index are legal),
    // so the error requires a truly unusable index.
    let mut t = rowid_table("t", vec![Column::numeric("x")], 1000);
    t.indexes.push({
        let mut ix = Index::new("tx", IndexKind::Plain, vec![IndexColumn::asc(0)]);
        ix.row_est = vec![1000, 2];
        ix.unordered = true;
        ix
    });
    let mut fi = FromItem::new(&t, CursorId(0));
    fi.indexed_by = Some("tx".to_owned());
    let input = WhereInput::new(vec![fi], None);
    let err = plan(&input, &PlannerOptions::default()).expect_err("no usable path");
    assert_eq!(err, PlanError::NoQuerySolution);
}

#[test]
fn reverse_order_knob_flips_everything() {
    let t = keyed_table("t", "k", "v", 100);
    let input = WhereInput::new(vec![FromItem::new(&t, CursorId(0))], None);
    let opts = PlannerOptions {
        reverse_order: true,
        ..PlannerOptions::default()
    };
    let p = plan(&input, &opts).expect("plan");
    assert!(p.levels[0].reversed);
}

// ---------------------------------------------------------------------------
// OR union of index scans
// ---------------------------------------------------------------------------

#[test]
fn indexable_or_uses_the_union_strategy() {
    let mut t = rowid_table(
        "t",
        vec![Column::numeric("x"), Column::numeric("y"), Column::numeric("z")],
        100_000,
    );
    t.indexes.push(
        Index::new("tx", IndexKind::Plain, vec![IndexColumn::asc(0)])
            .with_row_est(vec![100_000, 2]),
    );
    t.indexes.push(
        Index::new("ty", IndexKind::Plain, vec![IndexColumn::asc(1)])
            .with_row_est(vec![100_000, 2]),
    );

    // x=1 OR y>5: different columns, so no IN rewrite; both operands are
    // indexable on t, so the union of tx and ty scans applies.
    let w = Expr::or(
        eq(0, 0, 1),
        Expr::compare(CompareOp::Gt, Expr::column(CursorId(0), 1), Expr::integer(5)),
    );
    let input = WhereInput::new(vec![FromItem::new(&t, CursorId(0))], Some(&w));
    let p = planned(&input);

    let ScanPlan::OrUnion { branches, .. } = &p.levels[0].scan else {
        panic!("expected an OR union, got {:?}", p.levels[0].scan);
    };
    assert_eq!(branches.len(), 2);
}

// ---------------------------------------------------------------------------
// Virtual tables
// ---------------------------------------------------------------------------

struct EchoVtab;

impl VirtualTable for EchoVtab {
    fn best_index(&self, info: &mut BestIndexInfo) -> Result<(), String> {
        let mut argv = 0;
        for i in 0..info.constraints.len() {
            if info.constraints[i].usable {
                argv += 1;
                info.usage[i].argv_index = argv;
                info.usage[i].omit = true;
            }
        }
        info.idx_num = 7;
        info.idx_str = Some("echo".to_owned());
        info.estimated_cost = if argv > 0 { 10.0 } else { 1_000_000.0 };
        Ok(())
    }
}

struct BrokenVtab;

impl VirtualTable for BrokenVtab {
    fn best_index(&self, info: &mut BestIndexInfo) -> Result<(), String> {
        // Claim an argument slot for whatever comes first, usable or not.
        if !info.usage.is_empty() {
            info.usage[0].argv_index = 1;
        }
        info.estimated_cost = 1.0;
        Ok(())
    }
}

fn virtual_table(name: &str, module: Box<dyn VirtualTable>) -> Table {
    let mut t = Table::btree(name, vec![Column::numeric("a"), Column::numeric("b")], 1000);
    t.kind = TableKind::Virtual(module);
    t
}

#[test]
fn virtual_table_plans_through_best_index() {
    let vt = virtual_table("vt", Box::new(EchoVtab));
    let w = eq(0, 0, 42);
    let input = WhereInput::new(vec![FromItem::new(&vt, CursorId(0))], Some(&w));
    let p = planned(&input);
    let ScanPlan::VirtualScan {
        idx_num,
        idx_str,
        arg_map,
        omit_mask,
    } = &p.levels[0].scan
    else {
        panic!("expected a virtual scan, got {:?}", p.levels[0].scan);
    };
    assert_eq!(*idx_num, 7);
    assert_eq!(idx_str.as_deref(), Some("echo"));
    assert_eq!(arg_map.len(), 1);
    assert!(arg_map[0].is_some());
    assert_eq!(*omit_mask, 1);
}

#[test]
fn vtab_claiming_unusable_constraint_is_a_malfunction() {
    let vt = virtual_table("vt", Box::new(BrokenVtab));
    // A cross-table RHS makes the constraint unusable in phase 0.
    let t2 = keyed_table("t2", "k", "v", 10);
    let w = Expr::compare(
        CompareOp::Eq,
        Expr::column(CursorId(0), 0),
        Expr::column(CursorId(1), 1),
    );
    let input = WhereInput::new(
        vec![
            FromItem::new(&vt, CursorId(0)),
            FromItem::new(&t2, CursorId(1)),
        ],
        Some(&w),
    );
    let err = plan(&input, &PlannerOptions::default()).expect_err("malfunction");
    assert!(matches!(err, PlanError::BestIndexMalfunction { .. }));
}

// ---------------------------------------------------------------------------
// Transitive equality
// ---------------------------------------------------------------------------

#[test]
fn transitive_constant_reaches_the_index() {
    // t1.a = t2.b AND t2.b = 7 with an index on t1.a: the constant must
    // flow through the equivalence and let t1 be probed without waiting
    // on t2.
    let mut t1 = rowid_table("t1", vec![Column::numeric("a")], 100_000);
    t1.indexes.push(
        Index::new("t1a", IndexKind::Plain, vec![IndexColumn::asc(0)])
            .with_row_est(vec![100_000, 2]),
    );
    let t2 = Table::btree("t2", vec![Column::numeric("b")], 100_000);

    let w = Expr::and(
        Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::column(CursorId(1), 0),
        ),
        eq(1, 0, 7),
    );
    let input = WhereInput::new(
        vec![
            FromItem::new(&t1, CursorId(0)),
            FromItem::new(&t2, CursorId(1)),
        ],
        Some(&w),
    );
    let p = planned(&input);
    // Whatever the join order, t1 must be probed through t1a.
    let t1_level = p
        .levels
        .iter()
        .find(|l| l.from_pos == 0)
        .expect("t1 level");
    let ScanPlan::IndexScan { index_name, n_eq, .. } = &t1_level.scan else {
        panic!("t1 should be probed through its index, got {:?}", t1_level.scan);
    };
    assert_eq!(index_name, "t1a");
    assert_eq!(*n_eq, 1);
}

// ---------------------------------------------------------------------------
// Path invariants
// ---------------------------------------------------------------------------

#[test]
fn every_level_covers_a_distinct_from_position() {
    let t1 = keyed_table("t1", "a", "b", 100);
    let t2 = keyed_table("t2", "c", "d", 200);
    let t3 = keyed_table("t3", "e", "f", 300);
    let w = Expr::and(
        Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(0), 0),
            Expr::column(CursorId(1), 0),
        ),
        Expr::compare(
            CompareOp::Eq,
            Expr::column(CursorId(1), 0),
            Expr::column(CursorId(2), 0),
        ),
    );
    let input = WhereInput::new(
        vec![
            FromItem::new(&t1, CursorId(0)),
            FromItem::new(&t2, CursorId(1)),
            FromItem::new(&t3, CursorId(2)),
        ],
        Some(&w),
    );
    let p = planned(&input);
    assert_eq!(p.levels.len(), 3);
    let mut seen: Vec<usize> = p.levels.iter().map(|l| l.from_pos).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
}
