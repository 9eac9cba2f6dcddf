use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde_json::{Map, Value};

use crate::crdt::element::ElementMeta;
use crate::crdt::rga_split::{RgaSplitPos, RgaTreeSplit, SplitValue};
use crate::crdt::rht::Rht;
use crate::error::{Error, Result};
use crate::ids::{ActorId, TimeTicket};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A run of characters sharing one set of attributes.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextValue {
    content: String,
    attributes: Rht,
}

impl TextValue {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attributes: Rht::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attributes(&self) -> &Rht {
        &self.attributes
    }

    fn to_json_value(&self) -> Value {
        let mut map = Map::new();
        if !self.attributes.is_empty() {
            map.insert("attrs".to_string(), self.attributes.to_json_value());
        }
        map.insert("val".to_string(), Value::String(self.content.clone()));
        Value::Object(map)
    }
}

impl SplitValue for TextValue {
    fn len(&self) -> usize {
        self.content.chars().count()
    }

    fn split_off(&mut self, offset: usize) -> Self {
        let at = self
            .content
            .char_indices()
            .nth(offset)
            .map(|(i, _)| i)
            .unwrap_or(self.content.len());
        TextValue {
            content: self.content.split_off(at),
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextChange {
    pub from: usize,
    pub to: usize,
    pub content: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextStyleChange {
    pub from: usize,
    pub to: usize,
    pub attributes: BTreeMap<String, String>,
}

/// Result of [`CrdtText::edit`].
#[derive(Clone, Debug)]
pub struct TextEdit {
    pub changes: Vec<TextChange>,
    pub max_created_at_by_actor: HashMap<ActorId, TimeTicket>,
    pub has_garbage: bool,
    /// Content that became invisible, concatenated in document order.
    pub removed_content: String,
    /// The same content as runs of equal attributes.
    pub removed_runs: Vec<(String, BTreeMap<String, String>)>,
    /// Range covering what the edit inserted, in position form.
    pub inserted_range: (RgaSplitPos, RgaSplitPos),
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrdtText {
    pub(crate) meta: ElementMeta,
    rga: RgaTreeSplit<TextValue>,
}

impl CrdtText {
    pub fn new(created_at: TimeTicket) -> Self {
        Self {
            meta: ElementMeta::new(created_at),
            rga: RgaTreeSplit::new(),
        }
    }

    pub fn index_range_to_pos_range(&self, from: usize, to: usize) -> Result<(RgaSplitPos, RgaSplitPos)> {
        if from > to {
            return Err(Error::InvalidOperation(format!(
                "text range from {from} is after to {to}"
            )));
        }
        let from_pos = self.rga.index_to_pos(from)?;
        if from == to {
            return Ok((from_pos, from_pos));
        }
        Ok((from_pos, self.rga.index_to_pos(to)?))
    }

    pub fn edit(
        &mut self,
        from: &RgaSplitPos,
        to: &RgaSplitPos,
        content: &str,
        attributes: &BTreeMap<String, String>,
        edited_at: TimeTicket,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    ) -> Result<TextEdit> {
        let value = (!content.is_empty()).then(|| {
            let mut value = TextValue::new(content);
            for (key, attr) in attributes {
                value.attributes.set(key, attr, edited_at);
            }
            value
        });
        let edit = self
            .rga
            .edit(from, to, edited_at, value, max_created_at_by_actor)?;

        let changes = edit
            .changes
            .into_iter()
            .map(|change| {
                let (content, attributes) = change
                    .value
                    .map(|v| (v.content, v.attributes.to_map()))
                    .unwrap_or_default();
                TextChange {
                    from: change.from,
                    to: change.to,
                    content,
                    attributes,
                }
            })
            .collect();
        let removed_content = edit
            .removed_values
            .iter()
            .map(|v| v.content.as_str())
            .collect();
        let mut removed_runs: Vec<(String, BTreeMap<String, String>)> = Vec::new();
        for value in &edit.removed_values {
            let attributes = value.attributes.to_map();
            match removed_runs.last_mut() {
                Some((content, last)) if *last == attributes => content.push_str(&value.content),
                _ => removed_runs.push((value.content.clone(), attributes)),
            }
        }

        Ok(TextEdit {
            changes,
            max_created_at_by_actor: edit.max_created_at_by_actor,
            has_garbage: edit.has_garbage,
            removed_content,
            removed_runs,
            inserted_range: (edit.from_anchor, edit.inserted_end.unwrap_or(edit.from_anchor)),
        })
    }

    pub fn style(
        &mut self,
        from: &RgaSplitPos,
        to: &RgaSplitPos,
        attributes: &BTreeMap<String, String>,
        edited_at: TimeTicket,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    ) -> Result<(Vec<TextStyleChange>, HashMap<ActorId, TimeTicket>)> {
        let (ranges, max_created) =
            self.rga
                .style(from, to, edited_at, max_created_at_by_actor, |value| {
                    let mut applied = false;
                    for (key, attr) in attributes {
                        applied |= value.attributes.set(key, attr, edited_at);
                    }
                    applied
                })?;
        let changes = ranges
            .into_iter()
            .map(|(from, to)| TextStyleChange {
                from,
                to,
                attributes: attributes.clone(),
            })
            .collect();
        Ok((changes, max_created))
    }

    pub fn len(&self) -> usize {
        self.rga.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rga.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &TextValue> {
        self.rga.iter().map(|node| node.value())
    }

    pub fn rga(&self) -> &RgaTreeSplit<TextValue> {
        &self.rga
    }

    pub fn garbage_len(&self, safe: &TimeTicket) -> usize {
        self.rga.garbage_len(safe)
    }

    pub fn purge_removed(&mut self, safe: &TimeTicket) -> usize {
        self.rga.purge_removed(safe)
    }

    pub fn to_json_value(&self) -> Value {
        Value::Array(self.values().map(TextValue::to_json_value).collect())
    }
}

impl fmt::Display for CrdtText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for value in self.values() {
            f.write_str(&value.content)?;
        }
        Ok(())
    }
}
