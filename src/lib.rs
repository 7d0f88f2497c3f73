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

#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod error;
pub mod fcgi;
pub mod http;
pub mod lease;
pub mod socket;
pub mod stream;

pub use crate::{
    buffer::GrowingBuffer,
    error::{Error, FcgiErrorCode, HttpErrorCode, Result},
    lease::{Lease, PutAction},
    socket::{BufferedSocket, SpliceTarget},
    stream::{Bucket, BucketList, Stream, StreamHandler},
};
