use criterion::{criterion_group, criterion_main, Criterion};
use idres_core::{
    consolidate, elect_primary, needs_new_record, relink_targets, Contact, ContactId,
    LinkPrecedence, Observation,
};
use time::OffsetDateTime;

fn mk_cluster_member(index: i64) -> Contact {
    let link_precedence =
        if index % 250 == 0 { LinkPrecedence::Primary } else { LinkPrecedence::Secondary };
    let linked_id =
        if link_precedence == LinkPrecedence::Primary { None } else { Some(ContactId(index / 250 * 250 + 1)) };

    Contact {
        id: ContactId(index + 1),
        email: Some(format!("user{}@bench.example", index % 400)),
        phone_number: Some(format!("555{:05}", index % 400)),
        link_precedence,
        linked_id,
        created_at: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(index),
        updated_at: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(index),
        deleted_at: None,
    }
}

fn bench_election_and_consolidation(c: &mut Criterion) {
    let contacts = (0..1_000).map(mk_cluster_member).collect::<Vec<_>>();

    c.bench_function("elect_primary_1k", |b| {
        b.iter(|| elect_primary(&contacts));
    });

    c.bench_function("consolidate_1k", |b| {
        b.iter(|| consolidate(&contacts, ContactId(1)));
    });

    c.bench_function("relink_targets_1k", |b| {
        b.iter(|| relink_targets(&contacts, ContactId(1)));
    });
}

fn bench_new_record_decision(c: &mut Criterion) {
    let contacts = (0..1_000).map(mk_cluster_member).collect::<Vec<_>>();
    let observation = Observation::new(
        Some("unseen@bench.example".to_string()),
        Some("555-new".to_string()),
    );

    c.bench_function("needs_new_record_1k", |b| {
        b.iter(|| needs_new_record(&observation, &contacts));
    });
}

criterion_group!(benches, bench_election_and_consolidation, bench_new_record_decision);
criterion_main!(benches);
