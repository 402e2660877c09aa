use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Preprocessing techniques. Declaration order is application order: when a
/// run asks for both, vivification rewrites the formula first and backbone
/// extraction consumes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Technique {
    Vivification,
    Backbone,
}

impl Technique {
    pub fn letter(self) -> char {
        match self {
            Technique::Vivification => 'v',
            Technique::Backbone => 'b',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Technique::Vivification => "vivification",
            Technique::Backbone => "backbone",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TechniqueSet(BTreeSet<Technique>);

impl TechniqueSet {
    pub fn new<I: IntoIterator<Item = Technique>>(items: I) -> Self {
        TechniqueSet(items.into_iter().collect())
    }

    pub fn contains(&self, t: Technique) -> bool {
        self.0.contains(&t)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Techniques in application order.
    pub fn iter(&self) -> impl Iterator<Item = Technique> + '_ {
        self.0.iter().copied()
    }

    /// Short code used in run tags, e.g. `vb`.
    pub fn code(&self) -> String {
        self.iter().map(Technique::letter).collect()
    }
}

impl FromStr for TechniqueSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = BTreeSet::new();
        for c in s.chars().filter(|c| !matches!(c, ',' | '+' | ' ')) {
            let technique = match c.to_ascii_lowercase() {
                'v' => Technique::Vivification,
                'b' => Technique::Backbone,
                other => return Err(anyhow!("unknown technique letter: {}", other)),
            };
            set.insert(technique);
        }
        if set.is_empty() {
            return Err(anyhow!("empty technique set: {:?}", s));
        }
        Ok(TechniqueSet(set))
    }
}

impl fmt::Display for TechniqueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_follows_declared_order() {
        let set: TechniqueSet = "bv".parse().expect("parse");
        let order: Vec<_> = set.iter().collect();
        assert_eq!(order, vec![Technique::Vivification, Technique::Backbone]);
        assert_eq!(set.code(), "vb");
    }

    #[test]
    fn parse_rejects_unknown_and_empty() {
        assert!("x".parse::<TechniqueSet>().is_err());
        assert!("".parse::<TechniqueSet>().is_err());
        let set: TechniqueSet = "v,B".parse().expect("parse");
        assert!(set.contains(Technique::Vivification));
        assert!(set.contains(Technique::Backbone));
    }
}
