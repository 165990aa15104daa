// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

/// How a tag is compared against queued notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TagMatch {
    #[default]
    Prefix,
    Substring,
}

impl TagMatch {
    pub fn matches(&self, message: &[u8], tag: &[u8]) -> bool {
        match self {
            TagMatch::Prefix => message.starts_with(tag),
            TagMatch::Substring => {
                tag.is_empty() || message.windows(tag.len()).any(|window| window == tag)
            }
        }
    }
}

/// Notifications received from peer agents, queued per agent in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationMap {
    inner: BTreeMap<String, Vec<Vec<u8>>>,
}

impl NotificationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of agents that have notifications
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over the agent names that have notifications
    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// Notifications from `agent`, oldest first
    pub fn get(&self, agent: &str) -> Option<&[Vec<u8>]> {
        self.inner.get(agent).map(Vec::as_slice)
    }

    /// Total number of queued notifications across all agents
    pub fn total(&self) -> usize {
        self.inner.values().map(Vec::len).sum()
    }

    pub fn push(&mut self, agent: impl Into<String>, message: impl Into<Vec<u8>>) {
        self.inner
            .entry(agent.into())
            .or_default()
            .push(message.into());
    }

    /// Appends every entry of `other`; existing entries are never replaced
    pub fn merge(&mut self, other: NotificationMap) {
        for (agent, messages) in other.inner {
            self.inner.entry(agent).or_default().extend(messages);
        }
    }

    /// Removes the first notification from `agent` matching `tag`
    pub fn take_first_match(&mut self, agent: &str, tag: &[u8], mode: TagMatch) -> Option<Vec<u8>> {
        let messages = self.inner.get_mut(agent)?;
        let position = messages
            .iter()
            .position(|message| mode.matches(message, tag))?;
        let message = messages.remove(position);
        if messages.is_empty() {
            self.inner.remove(agent);
        }
        Some(message)
    }

    /// Clears all notifications
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.inner
            .iter()
            .map(|(agent, messages)| (agent.as_str(), messages.as_slice()))
    }
}

impl FromIterator<(String, Vec<u8>)> for NotificationMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        let mut map = NotificationMap::new();
        for (agent, message) in iter {
            map.push(agent, message);
        }
        map
    }
}
