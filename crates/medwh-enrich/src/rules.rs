//! Declarative category rules for detected labels.
//!
//! Rules are evaluated top to bottom and the first rule whose conditions all
//! hold decides the category; if none match the image is
//! [`ImageCategory::Other`]. The order of [`RULES`] is part of the contract:
//!
//! 1. container and person -> `promotional`
//! 2. container, no person -> `product_display`
//! 3. person, no container -> `lifestyle`
//! 4. tool -> `medical_tools`
//! 5. otherwise -> `other`
//!
//! Rule 4 is only reachable when neither a container nor a person was seen.

use std::collections::HashSet;

use medwh_core::ImageCategory;

/// A named set of detector labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelGroup {
    Container,
    Person,
    Tool,
}

impl LabelGroup {
    pub const ALL: [LabelGroup; 3] = [LabelGroup::Container, LabelGroup::Person, LabelGroup::Tool];

    #[must_use]
    pub fn labels(self) -> &'static [&'static str] {
        match self {
            LabelGroup::Container => &["bottle", "cup", "bowl"],
            LabelGroup::Person => &["person"],
            LabelGroup::Tool => &["scissors", "knife"],
        }
    }

    #[must_use]
    pub fn contains(self, label: &str) -> bool {
        self.labels().contains(&label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Has(LabelGroup),
    Lacks(LabelGroup),
}

impl Condition {
    fn holds(self, present: &HashSet<LabelGroup>) -> bool {
        match self {
            Condition::Has(group) => present.contains(&group),
            Condition::Lacks(group) => !present.contains(&group),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub conditions: &'static [Condition],
    pub category: ImageCategory,
}

pub const RULES: &[Rule] = &[
    Rule {
        conditions: &[
            Condition::Has(LabelGroup::Container),
            Condition::Has(LabelGroup::Person),
        ],
        category: ImageCategory::Promotional,
    },
    Rule {
        conditions: &[
            Condition::Has(LabelGroup::Container),
            Condition::Lacks(LabelGroup::Person),
        ],
        category: ImageCategory::ProductDisplay,
    },
    Rule {
        conditions: &[
            Condition::Has(LabelGroup::Person),
            Condition::Lacks(LabelGroup::Container),
        ],
        category: ImageCategory::Lifestyle,
    },
    Rule {
        conditions: &[Condition::Has(LabelGroup::Tool)],
        category: ImageCategory::MedicalTools,
    },
];

/// Groups represented by at least one label in `labels`.
pub fn present_groups<'a, I>(labels: I) -> HashSet<LabelGroup>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut present = HashSet::new();
    for label in labels {
        for group in LabelGroup::ALL {
            if group.contains(label) {
                present.insert(group);
            }
        }
    }
    present
}

/// First-match evaluation of `rules` against a set of present groups.
#[must_use]
pub fn first_match(rules: &[Rule], present: &HashSet<LabelGroup>) -> ImageCategory {
    rules
        .iter()
        .find(|rule| rule.conditions.iter().all(|c| c.holds(present)))
        .map_or(ImageCategory::Other, |rule| rule.category)
}

/// Category for an image given its detected labels, using [`RULES`].
pub fn categorize<'a, I>(labels: I) -> ImageCategory
where
    I: IntoIterator<Item = &'a str>,
{
    first_match(RULES, &present_groups(labels))
}
