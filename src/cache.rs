//! Metadata caches.
//!
//! Every cache holds one immutable generation behind a `RwLock<Arc<_>>`. Readers
//! clone the `Arc` and work against that generation for as long as they like.
//! Writers serialize on a separate mutex, build the next generation completely
//! and then swap the pointer, so a reader sees either the old or the new
//! generation and never a mix of both.
use bimap::BiMap;
use bigdecimal::BigDecimal;
use tracing::{debug, info};
use uuid::Uuid;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::construct::{
    Attribute, Classification, ClassificationRelation, Dimension, OtherHasher, SqlTable, Status, Type, Uom,
};
use crate::datatype::AttributeType;
use crate::error::{EfapsError, Result};

pub trait CacheObject: Send + Sync {
    const KIND: &'static str;
    fn cache_id(&self) -> i64;
    fn cache_name(&self) -> &str;
    fn cache_uuid(&self) -> Uuid;
}

// ------------- Generation -------------
#[derive(Debug)]
pub struct Generation<T> {
    number: u64,
    by_id: HashMap<i64, Arc<T>, OtherHasher>,
    names: BiMap<String, i64>,
    by_uuid: HashMap<Uuid, i64, OtherHasher>,
}

impl<T: CacheObject> Generation<T> {
    fn empty(number: u64) -> Self {
        Self {
            number,
            by_id: HashMap::default(),
            names: BiMap::new(),
            by_uuid: HashMap::default(),
        }
    }
    fn build(number: u64, objects: impl IntoIterator<Item = Arc<T>>) -> Self {
        let mut generation = Self::empty(number);
        for object in objects {
            generation.insert(object);
        }
        generation
    }
    fn insert(&mut self, object: Arc<T>) {
        let id = object.cache_id();
        self.names.insert(object.cache_name().to_string(), id);
        self.by_uuid.insert(object.cache_uuid(), id);
        self.by_id.insert(id, object);
    }
    pub fn number(&self) -> u64 {
        self.number
    }
    pub fn len(&self) -> usize {
        self.by_id.len()
    }
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
    pub fn get(&self, id: i64) -> Option<&Arc<T>> {
        self.by_id.get(&id)
    }
    pub fn by_name(&self, name: &str) -> Option<&Arc<T>> {
        self.names.get_by_left(name).and_then(|id| self.by_id.get(id))
    }
    pub fn by_uuid(&self, uuid: &Uuid) -> Option<&Arc<T>> {
        self.by_uuid.get(uuid).and_then(|id| self.by_id.get(id))
    }
    pub fn name_of(&self, id: i64) -> Option<&str> {
        self.names.get_by_right(&id).map(|n| n.as_str())
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.by_id.values()
    }
}

// ------------- Cache -------------
pub struct Cache<T> {
    current: RwLock<Arc<Generation<T>>>,
    writer: Mutex<u64>,
    initialized: AtomicBool,
}

impl<T: CacheObject> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheObject> Cache<T> {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Generation::empty(0))),
            writer: Mutex::new(0),
            initialized: AtomicBool::new(false),
        }
    }
    /// The generation that is current right now.
    pub fn snapshot(&self) -> Arc<Generation<T>> {
        // the guarded value is only ever replaced whole, so a poisoned lock still holds a complete generation
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
    fn swap(&self, generation: Generation<T>) -> Result<()> {
        let mut current = self.current.write()?;
        *current = Arc::new(generation);
        Ok(())
    }
    /// Loads the cache unless some earlier call already did. Returns whether a load happened.
    pub fn initialize<F>(&self, load: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Vec<T>>,
    {
        let mut next = self.writer.lock()?;
        if self.is_initialized() {
            return Ok(false);
        }
        let objects = load()?;
        *next += 1;
        let generation = Generation::build(*next, objects.into_iter().map(Arc::new));
        info!(kind = T::KIND, generation = *next, entries = generation.len(), "cache initialized");
        self.swap(generation)?;
        self.initialized.store(true, Ordering::Release);
        Ok(true)
    }
    /// Replaces the current generation regardless of its state.
    pub fn reload<F>(&self, load: F) -> Result<()>
    where
        F: FnOnce() -> Result<Vec<T>>,
    {
        let mut next = self.writer.lock()?;
        let objects = load()?;
        *next += 1;
        let generation = Generation::build(*next, objects.into_iter().map(Arc::new));
        info!(kind = T::KIND, generation = *next, entries = generation.len(), "cache reloaded");
        self.swap(generation)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }
    /// Copies the current generation, adds the object and swaps the copy in.
    pub fn add_object(&self, object: T) -> Result<Arc<T>> {
        let mut next = self.writer.lock()?;
        let current = self.snapshot();
        *next += 1;
        let object = Arc::new(object);
        let generation = Generation::build(
            *next,
            current
                .iter()
                .filter(|o| o.cache_id() != object.cache_id())
                .cloned()
                .chain(std::iter::once(Arc::clone(&object))),
        );
        debug!(kind = T::KIND, generation = *next, id = object.cache_id(), "cache object added");
        self.swap(generation)?;
        Ok(object)
    }
    /// Empties the cache. Lookups fail with `CacheNotReady` until it is initialized again.
    pub fn clear(&self) -> Result<()> {
        let mut next = self.writer.lock()?;
        *next += 1;
        self.swap(Generation::empty(*next))?;
        self.initialized.store(false, Ordering::Release);
        debug!(kind = T::KIND, generation = *next, "cache cleared");
        Ok(())
    }
    pub fn find_by_id(&self, id: i64) -> Option<Arc<T>> {
        self.snapshot().get(id).cloned()
    }
    pub fn find_by_name(&self, name: &str) -> Option<Arc<T>> {
        self.snapshot().by_name(name).cloned()
    }
    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<Arc<T>> {
        self.snapshot().by_uuid(uuid).cloned()
    }
    fn resolve(&self, found: Option<Arc<T>>, key: impl FnOnce() -> String) -> Result<Arc<T>> {
        match found {
            Some(object) => Ok(object),
            None if !self.is_initialized() => Err(EfapsError::CacheNotReady(T::KIND)),
            None => Err(EfapsError::CacheIntegrity {
                kind: T::KIND,
                key: key(),
            }),
        }
    }
    pub fn get_by_id(&self, id: i64) -> Result<Arc<T>> {
        self.resolve(self.find_by_id(id), || format!("id {}", id))
    }
    pub fn get_by_name(&self, name: &str) -> Result<Arc<T>> {
        self.resolve(self.find_by_name(name), || format!("name '{}'", name))
    }
    pub fn get_by_uuid(&self, uuid: &Uuid) -> Result<Arc<T>> {
        self.resolve(self.find_by_uuid(uuid), || format!("uuid {}", uuid))
    }
}

impl<T: CacheObject> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Cache")
            .field("kind", &T::KIND)
            .field("generation", &snapshot.number())
            .field("entries", &snapshot.len())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

// ------------- Metadata rows -------------
/// Rows of the metadata tables, references still as plain ids.
#[derive(Debug, Default, Clone)]
pub struct MetadataBatch {
    pub sql_tables: Vec<SqlTable>,
    pub types: Vec<TypeRecord>,
    pub type_classifications: Vec<(i64, i64)>,
    pub attributes: Vec<AttributeRecord>,
    pub statuses: Vec<StatusRecord>,
    pub classifications: Vec<ClassificationRecord>,
    pub dimensions: Vec<Dimension>,
    pub uoms: Vec<UomRecord>,
}

#[derive(Debug, Clone)]
pub struct TypeRecord {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub label: Option<String>,
    pub parent: Option<i64>,
    pub is_abstract: bool,
    pub main_table: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AttributeRecord {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub type_id: i64,
    pub attribute_type: String,
    pub table: i64,
    pub columns: String,
    pub link: Option<i64>,
    pub dimension: Option<i64>,
    pub status_group: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub id: i64,
    pub uuid: String,
    pub group: i64,
    pub key: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassificationRecord {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub label: Option<String>,
    pub parent: Option<i64>,
    pub relation: Option<ClassificationRelation>,
}

#[derive(Debug, Clone)]
pub struct UomRecord {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub dimension: i64,
    pub numerator: String,
    pub denominator: String,
}

pub trait MetadataSource {
    fn load_metadata(&self) -> Result<MetadataBatch>;
}

fn parse_uuid(kind: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EfapsError::Invariant(format!("{} has an invalid uuid '{}': {}", kind, raw, e)))
}

fn parse_decimal(kind: &str, raw: &str) -> Result<BigDecimal> {
    BigDecimal::from_str(raw).map_err(|e| EfapsError::Invariant(format!("{} has an invalid factor '{}': {}", kind, raw, e)))
}

/// Fully linked metadata objects, ready to be swapped into the caches.
struct Assembled {
    sql_tables: Vec<SqlTable>,
    types: Vec<Type>,
    attributes: Vec<Attribute>,
    statuses: Vec<Status>,
    classifications: Vec<Classification>,
    dimensions: Vec<Dimension>,
    uoms: Vec<Uom>,
}

fn type_name(records: &BTreeMap<i64, TypeRecord>, id: i64) -> Result<&str> {
    records
        .get(&id)
        .map(|t| t.name.as_str())
        .ok_or_else(|| EfapsError::Invariant(format!("reference to unknown type id {}", id)))
}

fn assemble(batch: MetadataBatch) -> Result<Assembled> {
    let type_records: BTreeMap<i64, TypeRecord> = batch.types.into_iter().map(|t| (t.id, t)).collect();

    // attributes, grouped by the type that declares them
    let mut attributes = Vec::new();
    let mut declared: HashMap<i64, Vec<Arc<Attribute>>> = HashMap::new();
    for record in batch.attributes {
        let attribute_type = AttributeType::from_str(&record.attribute_type)?;
        let columns: Vec<String> = record
            .columns
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let attribute = Attribute::new(
            record.id,
            parse_uuid("attribute", &record.uuid)?,
            record.name,
            type_name(&type_records, record.type_id)?,
            record.type_id,
            attribute_type,
            record.table,
            columns,
            record.link,
            record.dimension,
            record.status_group,
        )?;
        declared
            .entry(record.type_id)
            .or_default()
            .push(Arc::new(attribute.clone()));
        attributes.push(attribute);
    }

    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    for record in type_records.values() {
        if let Some(parent) = record.parent {
            type_name(&type_records, parent)?;
            children.entry(parent).or_default().push(record.id);
        }
    }
    let mut classified: HashMap<i64, Vec<i64>> = HashMap::new();
    for (type_id, classification_id) in batch.type_classifications {
        classified.entry(type_id).or_default().push(classification_id);
    }

    let mut types = Vec::new();
    for record in type_records.values() {
        // walk up to the root, then apply attributes from the root down so own ones win
        let mut chain = vec![record.id];
        let mut seen = HashSet::new();
        seen.insert(record.id);
        let mut cursor = record.parent;
        while let Some(parent) = cursor {
            if !seen.insert(parent) {
                return Err(EfapsError::Invariant(format!("type {} has a cyclic parent chain", record.name)));
            }
            chain.push(parent);
            cursor = type_records.get(&parent).and_then(|p| p.parent);
        }
        let mut map: HashMap<String, Arc<Attribute>, OtherHasher> = HashMap::default();
        let mut classified_by = Vec::new();
        for type_id in chain.iter().rev() {
            for attribute in declared.get(type_id).into_iter().flatten() {
                map.insert(attribute.name().to_string(), Arc::clone(attribute));
            }
            for c in classified.get(type_id).into_iter().flatten() {
                if !classified_by.contains(c) {
                    classified_by.push(*c);
                }
            }
        }
        let mut kids = children.get(&record.id).cloned().unwrap_or_default();
        kids.sort();
        types.push(Type::new(
            record.id,
            parse_uuid("type", &record.uuid)?,
            record.name.clone(),
            record.label.clone().unwrap_or_else(|| record.name.clone()),
            record.parent,
            record.is_abstract,
            record.main_table,
            map,
            kids,
            classified_by,
        ));
    }

    let mut statuses = Vec::new();
    for record in batch.statuses {
        statuses.push(Status::new(
            record.id,
            parse_uuid("status", &record.uuid)?,
            record.group,
            type_name(&type_records, record.group)?,
            record.key.clone(),
            record.label.unwrap_or(record.key),
        ));
    }

    // child classifications share the relation table of their root
    let class_records: BTreeMap<i64, ClassificationRecord> =
        batch.classifications.into_iter().map(|c| (c.id, c)).collect();
    let mut classifications = Vec::new();
    for record in class_records.values() {
        let mut relation = record.relation.clone();
        let mut cursor = record.parent;
        let mut hops = 0;
        while relation.is_none() {
            let parent = cursor.and_then(|p| class_records.get(&p)).ok_or_else(|| {
                EfapsError::Invariant(format!("classification {} has no relation table", record.name))
            })?;
            relation = parent.relation.clone();
            cursor = parent.parent;
            hops += 1;
            if hops > class_records.len() {
                return Err(EfapsError::Invariant(format!(
                    "classification {} has a cyclic parent chain",
                    record.name
                )));
            }
        }
        classifications.push(Classification::new(
            record.id,
            parse_uuid("classification", &record.uuid)?,
            record.name.clone(),
            record.label.clone().unwrap_or_else(|| record.name.clone()),
            record.parent,
            relation.ok_or_else(|| EfapsError::Invariant(format!("classification {} has no relation", record.name)))?,
        ));
    }

    let mut uoms = Vec::new();
    for record in batch.uoms {
        uoms.push(Uom::new(
            record.id,
            parse_uuid("uom", &record.uuid)?,
            record.name.clone(),
            record.dimension,
            parse_decimal(&record.name, &record.numerator)?,
            parse_decimal(&record.name, &record.denominator)?,
        )?);
    }

    Ok(Assembled {
        sql_tables: batch.sql_tables,
        types,
        attributes,
        statuses,
        classifications,
        dimensions: batch.dimensions,
        uoms,
    })
}

// ------------- MetadataCache -------------
/// All metadata caches of one database.
#[derive(Debug, Default)]
pub struct MetadataCache {
    sql_tables: Cache<SqlTable>,
    types: Cache<Type>,
    attributes: Cache<Attribute>,
    statuses: Cache<Status>,
    classifications: Cache<Classification>,
    dimensions: Cache<Dimension>,
    uoms: Cache<Uom>,
    writer: Mutex<()>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn sql_tables(&self) -> &Cache<SqlTable> {
        &self.sql_tables
    }
    pub fn types(&self) -> &Cache<Type> {
        &self.types
    }
    pub fn attributes(&self) -> &Cache<Attribute> {
        &self.attributes
    }
    pub fn statuses(&self) -> &Cache<Status> {
        &self.statuses
    }
    pub fn classifications(&self) -> &Cache<Classification> {
        &self.classifications
    }
    pub fn dimensions(&self) -> &Cache<Dimension> {
        &self.dimensions
    }
    pub fn uoms(&self) -> &Cache<Uom> {
        &self.uoms
    }
    pub fn is_initialized(&self) -> bool {
        self.sql_tables.is_initialized()
            && self.types.is_initialized()
            && self.attributes.is_initialized()
            && self.statuses.is_initialized()
            && self.classifications.is_initialized()
            && self.dimensions.is_initialized()
            && self.uoms.is_initialized()
    }
    /// Loads all caches from `source` once. Later calls are no-ops.
    pub fn initialize(&self, source: &dyn MetadataSource) -> Result<()> {
        let _writer = self.writer.lock()?;
        if self.is_initialized() {
            return Ok(());
        }
        self.load(source)
    }
    /// Reads all metadata again and swaps every cache in turn.
    ///
    /// Each cache swaps on its own, so a reader going from one cache to another
    /// while a reload runs may see the new generation of one and the old of the
    /// other. Attributes reached through a `Type` always come from the same load
    /// as the type.
    pub fn reload(&self, source: &dyn MetadataSource) -> Result<()> {
        let _writer = self.writer.lock()?;
        self.load(source)
    }
    fn load(&self, source: &dyn MetadataSource) -> Result<()> {
        let assembled = assemble(source.load_metadata()?)?;
        self.sql_tables.reload(|| Ok(assembled.sql_tables))?;
        self.types.reload(|| Ok(assembled.types))?;
        self.attributes.reload(|| Ok(assembled.attributes))?;
        self.statuses.reload(|| Ok(assembled.statuses))?;
        self.classifications.reload(|| Ok(assembled.classifications))?;
        self.dimensions.reload(|| Ok(assembled.dimensions))?;
        self.uoms.reload(|| Ok(assembled.uoms))?;
        Ok(())
    }
    pub fn clear(&self) -> Result<()> {
        let _writer = self.writer.lock()?;
        self.sql_tables.clear()?;
        self.types.clear()?;
        self.attributes.clear()?;
        self.statuses.clear()?;
        self.classifications.clear()?;
        self.dimensions.clear()?;
        self.uoms.clear()?;
        Ok(())
    }

    /// The type and all its descendants, parents before children.
    pub fn type_family(&self, type_id: i64) -> Result<Vec<Arc<Type>>> {
        let mut family = Vec::new();
        let mut pending = vec![type_id];
        let mut seen = HashSet::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let t = self.types.get_by_id(id)?;
            pending.extend(t.children().iter().rev());
            family.push(t);
        }
        Ok(family)
    }
    pub fn main_table_of(&self, t: &Type) -> Result<Arc<SqlTable>> {
        let table = t
            .main_table()
            .ok_or_else(|| EfapsError::Execution(format!("type {} has no main table", t.name())))?;
        self.sql_tables.get_by_id(table)
    }
    /// Parent chain of a classification, nearest parent first.
    pub fn classification_ancestors(&self, id: i64) -> Result<Vec<i64>> {
        let mut ancestors = Vec::new();
        let mut cursor = self.classifications.get_by_id(id)?.parent();
        while let Some(parent) = cursor {
            if ancestors.contains(&parent) {
                return Err(EfapsError::Invariant(format!("classification {} has a cyclic parent chain", id)));
            }
            ancestors.push(parent);
            cursor = self.classifications.get_by_id(parent)?.parent();
        }
        Ok(ancestors)
    }
    /// The classification and everything below it.
    pub fn classification_tree(&self, root: i64) -> Result<Vec<Arc<Classification>>> {
        let snapshot = self.classifications.snapshot();
        let mut tree = vec![self.classifications.get_by_id(root)?];
        for c in snapshot.iter() {
            if c.id() != root && self.classification_ancestors(c.id())?.contains(&root) {
                tree.push(Arc::clone(c));
            }
        }
        tree.sort_by_key(|c| c.id());
        Ok(tree)
    }
}
