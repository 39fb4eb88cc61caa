use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::descriptor::{append_parameter, check_appended};
use crate::ir::CallKind;
use crate::location::LocationType;
use crate::signature::MethodKey;

/// Task posting entry points that have a location-taking overload.
const CHROMIUM_TARGETS: &[(CallKind, &str, &str, &str, bool)] = &[
    (
        CallKind::Interface,
        "org/chromium/base/task/TaskRunner",
        "postDelayedTask",
        "(Ljava/lang/Runnable;J)V",
        true,
    ),
    (
        CallKind::Virtual,
        "org/chromium/base/task/TaskRunnerImpl",
        "postDelayedTask",
        "(Ljava/lang/Runnable;J)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/task/PostTask",
        "postTask",
        "(ILjava/lang/Runnable;)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/task/PostTask",
        "postDelayedTask",
        "(ILjava/lang/Runnable;J)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/task/PostTask",
        "runOrPostTask",
        "(ILjava/lang/Runnable;)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/task/PostTask",
        "runSynchronously",
        "(ILjava/util/concurrent/Callable;)Ljava/lang/Object;",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/task/PostTask",
        "runSynchronously",
        "(ILjava/lang/Runnable;)V",
        false,
    ),
    (
        CallKind::Virtual,
        "org/chromium/base/task/ChainedTasks",
        "add",
        "(ILjava/lang/Runnable;)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/ThreadUtils",
        "runOnUiThreadBlocking",
        "(Ljava/lang/Runnable;)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/ThreadUtils",
        "runOnUiThreadBlocking",
        "(Ljava/util/concurrent/Callable;)Ljava/lang/Object;",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/ThreadUtils",
        "runOnUiThread",
        "(Ljava/lang/Runnable;)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/ThreadUtils",
        "postOnUiThread",
        "(Ljava/lang/Runnable;)V",
        false,
    ),
    (
        CallKind::Static,
        "org/chromium/base/ThreadUtils",
        "postOnUiThreadDelayed",
        "(Ljava/lang/Runnable;J)V",
        false,
    ),
    (
        CallKind::Virtual,
        "org/chromium/base/task/AsyncTask",
        "executeOnExecutor",
        "(Lorg/chromium/base/task/LocationAwareExecutor;)Lorg/chromium/base/task/AsyncTask;",
        false,
    ),
    (
        CallKind::Virtual,
        "org/chromium/base/task/AsyncTask",
        "executeOnTaskRunner",
        "(Lorg/chromium/base/task/TaskRunner;)Lorg/chromium/base/task/AsyncTask;",
        false,
    ),
    (
        CallKind::Virtual,
        "org/chromium/base/task/AsyncTask",
        "executeWithTaskTraits",
        "(I)Lorg/chromium/base/task/AsyncTask;",
        false,
    ),
    (
        CallKind::Interface,
        "org/chromium/base/task/LocationAwareExecutor",
        "execute",
        "(Ljava/lang/Runnable;)V",
        true,
    ),
];

/// AsyncTask launch methods matched on any owner. Call sites name the concrete
/// AsyncTask subclass, which this pass cannot enumerate, so only the name and
/// descriptor are compared.
// TODO: replace with real subclass resolution once the pass sees a whole
// application instead of one library's classes at a time.
const ASYNC_TASK_EXECUTE: &[(&str, &str)] = &[
    (
        "executeOnExecutor",
        "(Lorg/chromium/base/task/LocationAwareExecutor;)Lorg/chromium/base/task/AsyncTask;",
    ),
    (
        "executeOnTaskRunner",
        "(Lorg/chromium/base/task/TaskRunner;)Lorg/chromium/base/task/AsyncTask;",
    ),
    ("executeWithTaskTraits", "(I)Lorg/chromium/base/task/AsyncTask;"),
];

/// Rewritten call shape returned by a registry lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Overload {
    pub(crate) key: MethodKey,
    /// Matched by name and descriptor only.
    pub(crate) fallback: bool,
}

#[derive(Clone, Debug)]
struct FallbackRule {
    name: String,
    descriptor: String,
    rewritten_descriptor: String,
}

/// Immutable table of rewrite targets, built once and shared by every
/// rewrite.
#[derive(Clone, Debug)]
pub(crate) struct TargetRegistry {
    location: LocationType,
    overloads: HashMap<MethodKey, MethodKey>,
    fallbacks: Vec<FallbackRule>,
}

/// Collects rules and validates them in [`RegistryBuilder::build`].
#[derive(Clone, Debug)]
pub(crate) struct RegistryBuilder {
    location: LocationType,
    targets: Vec<MethodKey>,
    fallbacks: Vec<(String, String)>,
}

impl TargetRegistry {
    pub(crate) fn builder(location: LocationType) -> RegistryBuilder {
        RegistryBuilder {
            location,
            targets: Vec::new(),
            fallbacks: Vec::new(),
        }
    }

    /// The hand-maintained table of Chromium task posting APIs.
    pub(crate) fn chromium() -> Result<Self> {
        let mut builder = Self::builder(LocationType::default());
        for (kind, owner, name, descriptor, is_interface) in CHROMIUM_TARGETS {
            builder = builder.target(*kind, owner, name, descriptor, *is_interface);
        }
        for (name, descriptor) in ASYNC_TASK_EXECUTE {
            builder = builder.fallback(name, descriptor);
        }
        builder.build().context("build chromium rewrite targets")
    }

    pub(crate) fn location_type(&self) -> &LocationType {
        &self.location
    }

    pub(crate) fn len(&self) -> usize {
        self.overloads.len() + self.fallbacks.len()
    }

    /// Rewritten call shape for a call site, or `None` when the call must be
    /// left untouched.
    pub(crate) fn lookup(&self, call: &MethodKey) -> Option<Overload> {
        if let Some(key) = self.overloads.get(call) {
            return Some(Overload {
                key: key.clone(),
                fallback: false,
            });
        }
        self.fallbacks
            .iter()
            .find(|rule| rule.name == call.name && rule.descriptor == call.descriptor)
            .map(|rule| Overload {
                key: call.with_descriptor(rule.rewritten_descriptor.clone()),
                fallback: true,
            })
    }
}

impl RegistryBuilder {
    pub(crate) fn target(
        mut self,
        kind: CallKind,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Self {
        self.targets
            .push(MethodKey::new(kind, owner, name, descriptor, is_interface));
        self
    }

    pub(crate) fn fallback(mut self, name: &str, descriptor: &str) -> Self {
        self.fallbacks
            .push((name.to_string(), descriptor.to_string()));
        self
    }

    pub(crate) fn build(self) -> Result<TargetRegistry> {
        let parameter = self.location.descriptor();

        let mut overloads = HashMap::with_capacity(self.targets.len());
        for target in self.targets {
            match (target.kind, target.is_interface) {
                (CallKind::Interface, false) => {
                    anyhow::bail!("{target}: interface dispatch on a non-interface owner")
                }
                (CallKind::Virtual, true) => {
                    anyhow::bail!("{target}: virtual dispatch on an interface owner")
                }
                _ => {}
            }
            let rewritten = derive(&target.descriptor, &parameter)
                .with_context(|| format!("derive overload for {target}"))?;
            let overload = target.with_descriptor(rewritten);
            if overloads.insert(target.clone(), overload).is_some() {
                anyhow::bail!("duplicate rewrite target {target}");
            }
        }

        let mut fallbacks: Vec<FallbackRule> = Vec::with_capacity(self.fallbacks.len());
        for (name, descriptor) in self.fallbacks {
            if fallbacks
                .iter()
                .any(|rule| rule.name == name && rule.descriptor == descriptor)
            {
                anyhow::bail!("duplicate fallback target {name}{descriptor}");
            }
            let rewritten_descriptor = derive(&descriptor, &parameter)
                .with_context(|| format!("derive overload for fallback {name}{descriptor}"))?;
            fallbacks.push(FallbackRule {
                name,
                descriptor,
                rewritten_descriptor,
            });
        }

        let registry = TargetRegistry {
            location: self.location,
            overloads,
            fallbacks,
        };
        registry.check_fixed_point()?;
        Ok(registry)
    }
}

impl TargetRegistry {
    /// A rewritten call must never match again, otherwise a second pass over
    /// the same classes would append a second location argument.
    fn check_fixed_point(&self) -> Result<()> {
        let rewritten = self.overloads.values().cloned().chain(
            self.fallbacks.iter().map(|rule| {
                MethodKey::new(
                    CallKind::Virtual,
                    "",
                    &rule.name,
                    &rule.rewritten_descriptor,
                    false,
                )
            }),
        );
        for key in rewritten {
            if let Some(again) = self.lookup(&key) {
                anyhow::bail!("rewritten call {key} matches rewrite target again as {}", again.key);
            }
        }
        Ok(())
    }
}

fn derive(descriptor: &str, parameter: &str) -> Result<String> {
    let rewritten = append_parameter(descriptor, parameter)?;
    check_appended(descriptor, &rewritten, parameter)?;
    Ok(rewritten)
}
