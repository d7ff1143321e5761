//! Applicability filter for declarative definition entries.
//!
//! Package sets, repositories, actions and environment overrides all carry
//! `releases`/`architectures`/`variants`/`types` lists. An entry applies to a
//! build when its release, architecture and variant lists accept the current
//! values and its `types` list agrees with the image targets the current build
//! stage accepts.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Image kinds an evaluation stage accepts entries for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageTarget: u8 {
        const UNDEFINED = 1 << 0;
        const ALL = 1 << 1;
        const CONTAINER = 1 << 2;
        const VM = 1 << 3;
    }
}

impl ImageTarget {
    /// Targets accepted by a build of the given kind: entries without `types`,
    /// entries listing both kinds, and entries for this kind.
    pub fn for_build(kind: TargetType) -> Self {
        ImageTarget::UNDEFINED | ImageTarget::ALL | kind.image_target()
    }
}

/// The concrete kind of artifact a build run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Container,
    Vm,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Container => "container",
            TargetType::Vm => "vm",
        }
    }

    pub fn image_target(&self) -> ImageTarget {
        match self {
            TargetType::Container => ImageTarget::CONTAINER,
            TargetType::Vm => ImageTarget::VM,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standalone selection criteria.
///
/// Empty lists match anything for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TargetType>,
}

/// Anything that carries filter fields.
pub trait Filterable {
    fn releases(&self) -> &[String];
    fn architectures(&self) -> &[String];
    fn variants(&self) -> &[String];
    fn types(&self) -> &[TargetType];
}

/// Implement [`Filterable`] for a struct with `releases`, `architectures`,
/// `variants` and `types` fields.
#[macro_export]
macro_rules! impl_filterable {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::filter::Filterable for $ty {
                fn releases(&self) -> &[String] {
                    &self.releases
                }
                fn architectures(&self) -> &[String] {
                    &self.architectures
                }
                fn variants(&self) -> &[String] {
                    &self.variants
                }
                fn types(&self) -> &[$crate::filter::TargetType] {
                    &self.types
                }
            }
        )+
    };
}

impl_filterable!(Filter);

/// The build-side values an entry is matched against.
#[derive(Debug, Clone, Copy)]
pub struct BuildSelector<'a> {
    pub release: &'a str,
    pub architecture: &'a str,
    pub variant: &'a str,
    pub target_type: TargetType,
}

impl BuildSelector<'_> {
    pub fn accepts<F: Filterable + ?Sized>(&self, entry: &F, accepted: ImageTarget) -> bool {
        matches(
            entry,
            self.release,
            self.architecture,
            self.variant,
            self.target_type,
            accepted,
        )
    }
}

/// Decide whether `entry` applies to the current build.
pub fn matches<F: Filterable + ?Sized>(
    entry: &F,
    release: &str,
    architecture: &str,
    variant: &str,
    target_type: TargetType,
    accepted: ImageTarget,
) -> bool {
    if !accepts_value(entry.releases(), release)
        || !accepts_value(entry.architectures(), architecture)
        || !accepts_value(entry.variants(), variant)
    {
        return false;
    }

    let types = entry.types();
    let concrete = ImageTarget::CONTAINER | ImageTarget::VM;

    if types.is_empty() {
        return !accepted.intersects(concrete) || accepted.contains(ImageTarget::UNDEFINED);
    }

    let lists = |kind: TargetType| types.contains(&kind);

    if accepted.contains(ImageTarget::ALL)
        && lists(TargetType::Container)
        && lists(TargetType::Vm)
    {
        return true;
    }

    if accepted.contains(ImageTarget::CONTAINER)
        && target_type == TargetType::Container
        && lists(TargetType::Container)
    {
        return true;
    }

    accepted.contains(ImageTarget::VM) && target_type == TargetType::Vm && lists(TargetType::Vm)
}

fn accepts_value(allowed: &[String], value: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|v| v == value)
}
