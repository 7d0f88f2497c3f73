// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Narrow collaborator interfaces: pooled-resource leases and the
//! tracing stopwatch.

/// What to do with a pooled resource when giving it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutAction {
    /// The resource is clean and may serve another user.
    Reuse,

    /// The resource is dirty or broken; dispose of it.
    Destroy,
}

/// Returns a leased resource to its pool.
///
/// `Reuse` is only ever passed after a clean protocol end with an empty
/// input buffer.
pub trait Lease<T> {
    fn release(&mut self, resource: T, action: PutAction);
}

/// A lease that simply drops the resource.
#[derive(Default)]
pub struct DropLease;

impl<T> Lease<T> for DropLease {
    fn release(&mut self, _resource: T, _action: PutAction) {}
}

/// Records labelled events for request tracing.
pub trait Stopwatch {
    fn record(&mut self, label: &'static str);
}

/// A stopwatch that forwards to `tracing`.
#[derive(Default)]
pub struct TracingStopwatch;

impl Stopwatch for TracingStopwatch {
    fn record(&mut self, label: &'static str) {
        tracing::trace!(label, "stopwatch");
    }
}

/// A stopwatch that discards everything.
#[derive(Default)]
pub struct NoopStopwatch;

impl Stopwatch for NoopStopwatch {
    fn record(&mut self, _label: &'static str) {}
}
