use super::{
	Loser, MergePolicy, MergeSource, MergeUnit, MergeVerdict, RiskLevel, SlotConflict, Winner,
};
use crate::{
	config::{ResolverConfig, Thresholds},
	ops::parse::{Entry, Operator, Value},
};

use std::collections::{BTreeSet, HashMap};

/// Resolve one unit under the policy configured for its symbol type.
///
/// Pure: the verdict depends only on the ordered sources and `config`.
/// Returns `None` for a unit without sources.
pub fn resolve(unit: &MergeUnit, config: &ResolverConfig) -> Option<MergeVerdict> {
	let first = unit.sources.first()?;
	let last = unit.sources.last()?;

	let container = config.containers.get(&unit.identity.symbol_type);
	let policy = match (config.policy_for(&unit.identity.symbol_type), container) {
		// Only declared container types can be merged as containers
		(MergePolicy::ContainerMerge, None) => MergePolicy::Override,
		(policy, _) => policy,
	};

	if unit.sources.len() == 1 {
		return Some(MergeVerdict {
			identity: unit.identity.clone(),
			policy,
			sources: 1,
			winner: winner(first, "only definition"),
			losers: Vec::new(),
			risk: RiskLevel::Info,
			risk_reason: "single source".to_string(),
			effective: first.body.clone(),
			slot_conflicts: Vec::new(),
		});
	}

	let verdict = match (policy, container) {
		(MergePolicy::ContainerMerge, Some(container)) => {
			container_merge(unit, last, &container.list_keys)
		}
		(MergePolicy::PerKeyOverride, _) => per_key_override(unit, last),
		(MergePolicy::Fios, _) => first_in(unit, first),
		_ => last_wins(unit, first, last, &config.thresholds),
	};

	Some(MergeVerdict { policy, ..verdict })
}

/// Share of top level entries that differ between two bodies, from 0 (same
/// entries) to 1 (nothing in common). Entry order and source lines are ignored.
pub fn structural_delta(before: &Value, after: &Value) -> f64 {
	let before = top_level(before);
	let after = top_level(after);

	let union = before.union(&after).count();
	if union == 0 {
		return 0.0;
	}
	let difference = before.symmetric_difference(&after).count();
	difference as f64 / union as f64
}

fn top_level(value: &Value) -> BTreeSet<String> {
	match value {
		Value::Scalar(s) => BTreeSet::from([s.clone()]),
		Value::Block(entries) => entries.iter().map(Entry::canonical).collect(),
	}
}

fn winner(source: &MergeSource, reason: impl Into<String>) -> Winner {
	Winner {
		package: source.package.clone(),
		file: source.rel_path.clone(),
		reason: reason.into(),
	}
}

fn loser(source: &MergeSource) -> Loser {
	Loser {
		package: source.package.clone(),
		file: source.rel_path.clone(),
	}
}

fn verdict(
	unit: &MergeUnit,
	winner: Winner,
	losers: Vec<Loser>,
	(risk, risk_reason): (RiskLevel, String),
	effective: Value,
) -> MergeVerdict {
	MergeVerdict {
		identity: unit.identity.clone(),
		policy: MergePolicy::default(),
		sources: unit.sources.len(),
		winner,
		losers,
		risk,
		risk_reason,
		effective,
		slot_conflicts: Vec::new(),
	}
}

fn last_wins(
	unit: &MergeUnit,
	first: &MergeSource,
	last: &MergeSource,
	thresholds: &Thresholds,
) -> MergeVerdict {
	let count = unit.sources.len();
	let delta = structural_delta(&first.body, &last.body);

	let risk = if last.intended {
		(
			RiskLevel::Info,
			format!("{} deliberately replaces {}", last.package, last.rel_path),
		)
	} else if count >= thresholds.major_source_count {
		(
			RiskLevel::Major,
			format!("{count} packages define this identity"),
		)
	} else if delta >= thresholds.major_delta_ratio {
		(
			RiskLevel::Major,
			format!("structural delta {delta:.2} against {}", first.package),
		)
	} else {
		(
			RiskLevel::Minor,
			format!("narrow override of {} (delta {delta:.2})", first.package),
		)
	};

	verdict(
		unit,
		winner(last, "last in load order"),
		unit.sources[..count - 1].iter().map(loser).collect(),
		risk,
		last.body.clone(),
	)
}

fn first_in(unit: &MergeUnit, first: &MergeSource) -> MergeVerdict {
	let ignored = unit.sources.len() - 1;
	verdict(
		unit,
		winner(first, "first in load order"),
		unit.sources[1..].iter().map(loser).collect(),
		(
			RiskLevel::Minor,
			format!("{ignored} later definition(s) ignored"),
		),
		first.body.clone(),
	)
}

/// Keyed entries folded across sources in load order.
struct Folded {
	entries: Vec<Entry>,
	/// Single-slot keys with their definers, in first appearance order
	slots: Vec<(String, Vec<String>)>,
}

fn fold(unit: &MergeUnit, list_keys: &[String]) -> Folded {
	enum Slot {
		List(u32, Vec<Entry>),
		Single(Entry, Vec<String>),
	}

	let mut order: Vec<String> = Vec::new();
	let mut slots: HashMap<String, Slot> = HashMap::new();
	let mut items: Vec<Entry> = Vec::new();

	for source in &unit.sources {
		for entry in source.body.entries() {
			let Some(key) = &entry.key else {
				items.push(entry.clone());
				continue;
			};

			if list_keys.contains(key) {
				let slot = slots.entry(key.clone()).or_insert_with(|| {
					order.push(key.clone());
					Slot::List(entry.line, Vec::new())
				});
				if let Slot::List(_, list) = slot {
					match &entry.value {
						Value::Block(inner) => list.extend(inner.iter().cloned()),
						scalar @ Value::Scalar(_) => list.push(Entry::item(scalar.clone(), entry.line)),
					}
				}
				continue;
			}

			match slots.get_mut(key) {
				Some(Slot::Single(current, definers)) => {
					*current = entry.clone();
					if !definers.contains(&source.package) {
						definers.push(source.package.clone());
					}
				}
				Some(Slot::List(..)) => {}
				None => {
					order.push(key.clone());
					slots.insert(
						key.clone(),
						Slot::Single(entry.clone(), vec![source.package.clone()]),
					);
				}
			}
		}
	}

	let mut folded = Folded {
		entries: Vec::with_capacity(order.len() + items.len()),
		slots: Vec::new(),
	};
	for key in order {
		match slots.remove(&key) {
			Some(Slot::List(line, list)) => {
				folded
					.entries
					.push(Entry::keyed(key, Operator::Assign, Value::Block(list), line));
			}
			Some(Slot::Single(entry, definers)) => {
				folded.entries.push(entry);
				folded.slots.push((key, definers));
			}
			None => {}
		}
	}
	folded.entries.extend(items);
	folded
}

fn source_of<'a>(unit: &'a MergeUnit, package: &str) -> Option<&'a MergeSource> {
	unit.sources.iter().find(|source| source.package == package)
}

fn container_merge(unit: &MergeUnit, last: &MergeSource, list_keys: &[String]) -> MergeVerdict {
	let folded = fold(unit, list_keys);

	let slot_conflicts: Vec<SlotConflict> = folded
		.slots
		.into_iter()
		.filter(|(_, definers)| definers.len() > 1)
		.map(|(key, packages)| SlotConflict { key, packages })
		.collect();

	// Earlier definers of a contested slot lose that slot
	let mut losers: Vec<Loser> = Vec::new();
	for conflict in &slot_conflicts {
		for package in &conflict.packages[..conflict.packages.len() - 1] {
			if let Some(source) = source_of(unit, package) {
				let lost = loser(source);
				if !losers.contains(&lost) {
					losers.push(lost);
				}
			}
		}
	}

	let risk = if slot_conflicts.is_empty() {
		(
			RiskLevel::Info,
			format!("conflict-free merge of {} sources", unit.sources.len()),
		)
	} else {
		let keys: Vec<&str> = slot_conflicts.iter().map(|c| c.key.as_str()).collect();
		(
			RiskLevel::Critical,
			format!("single-slot key(s) defined more than once: {}", keys.join(", ")),
		)
	};

	MergeVerdict {
		slot_conflicts,
		..verdict(
			unit,
			winner(last, "list keys merged in load order"),
			losers,
			risk,
			Value::Block(folded.entries),
		)
	}
}

fn per_key_override(unit: &MergeUnit, last: &MergeSource) -> MergeVerdict {
	let folded = fold(unit, &[]);

	let overridden = folded
		.slots
		.iter()
		.filter(|(_, definers)| definers.len() > 1)
		.count();

	// A source loses when none of its keys survived
	let survivors: BTreeSet<&str> = folded
		.slots
		.iter()
		.filter_map(|(_, definers)| definers.last().map(String::as_str))
		.collect();
	let losers = unit
		.sources
		.iter()
		.filter(|source| {
			source.package != last.package && !survivors.contains(source.package.as_str())
		})
		.map(loser)
		.collect();

	let risk = if overridden == 0 {
		(RiskLevel::Info, "disjoint keys".to_string())
	} else {
		(
			RiskLevel::Minor,
			format!("{overridden} key(s) overridden"),
		)
	};

	verdict(
		unit,
		winner(last, "last definer of each key"),
		losers,
		risk,
		Value::Block(folded.entries),
	)
}
