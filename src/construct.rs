// metadata objects are shared between cache generations and decoded values
use std::sync::{Arc, Mutex, MutexGuard};

// attribute maps use a fast non-cryptographic hash
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;
use std::collections::HashMap;

use bigdecimal::BigDecimal;
use tracing::{debug, info};
use uuid::Uuid;

// used to print out readable forms of a construct
use std::fmt;

// our own stuff that we need
use crate::cache::{CacheObject, MetadataCache};
use crate::context::{ExecProgram, ProgramRegistry};
use crate::datatype::AttributeType;
use crate::error::{EfapsError, Result};
use crate::model::ModelDefinition;
use crate::persist::Persistor;

pub type OtherHasher = BuildHasherDefault<SeaHasher>;

// ------------- SqlTable -------------
#[derive(Debug, Clone)]
pub struct SqlTable {
    id: i64,
    uuid: Uuid,
    name: String,
    sql_name: String,
    id_column: String,
    type_column: Option<String>,
    parent: Option<i64>,
}
impl SqlTable {
    pub fn new(
        id: i64,
        uuid: Uuid,
        name: String,
        sql_name: String,
        id_column: String,
        type_column: Option<String>,
        parent: Option<i64>,
    ) -> Self {
        Self {
            id,
            uuid,
            name,
            sql_name,
            id_column,
            type_column,
            parent,
        }
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn sql_name(&self) -> &str {
        &self.sql_name
    }
    pub fn id_column(&self) -> &str {
        &self.id_column
    }
    /// Tables shared by several types discriminate rows by this column.
    pub fn type_column(&self) -> Option<&str> {
        self.type_column.as_deref()
    }
    /// Set for child tables, which share ids with their parent table.
    pub fn parent(&self) -> Option<i64> {
        self.parent
    }
}
impl CacheObject for SqlTable {
    const KIND: &'static str = "SqlTable";
    fn cache_id(&self) -> i64 {
        self.id
    }
    fn cache_name(&self) -> &str {
        &self.name
    }
    fn cache_uuid(&self) -> Uuid {
        self.uuid
    }
}

// ------------- Attribute -------------
#[derive(Debug, Clone)]
pub struct Attribute {
    id: i64,
    uuid: Uuid,
    name: String,
    qualified_name: String,
    parent_type: i64,
    attribute_type: AttributeType,
    table: i64,
    columns: Vec<String>,
    link: Option<i64>,
    dimension: Option<i64>,
    status_group: Option<i64>,
}
impl Attribute {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        uuid: Uuid,
        name: String,
        type_name: &str,
        parent_type: i64,
        attribute_type: AttributeType,
        table: i64,
        columns: Vec<String>,
        link: Option<i64>,
        dimension: Option<i64>,
        status_group: Option<i64>,
    ) -> Result<Self> {
        if columns.len() != attribute_type.arity() {
            return Err(EfapsError::Invariant(format!(
                "attribute {}/{} of type {} declares {} columns but consumes {}",
                type_name,
                name,
                attribute_type,
                columns.len(),
                attribute_type.arity()
            )));
        }
        if attribute_type.is_link() && link.is_none() {
            return Err(EfapsError::Invariant(format!(
                "link attribute {}/{} has no target type",
                type_name, name
            )));
        }
        let qualified_name = format!("{}/{}", type_name, name);
        Ok(Self {
            id,
            uuid,
            name,
            qualified_name,
            parent_type,
            attribute_type,
            table,
            columns,
            link,
            dimension,
            status_group,
        })
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }
    pub fn parent_type(&self) -> i64 {
        self.parent_type
    }
    pub fn attribute_type(&self) -> AttributeType {
        self.attribute_type
    }
    pub fn table(&self) -> i64 {
        self.table
    }
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
    pub fn link(&self) -> Option<i64> {
        self.link
    }
    pub fn dimension(&self) -> Option<i64> {
        self.dimension
    }
    pub fn status_group(&self) -> Option<i64> {
        self.status_group
    }
}
impl CacheObject for Attribute {
    const KIND: &'static str = "Attribute";
    fn cache_id(&self) -> i64 {
        self.id
    }
    fn cache_name(&self) -> &str {
        &self.qualified_name
    }
    fn cache_uuid(&self) -> Uuid {
        self.uuid
    }
}
impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.qualified_name, self.attribute_type)
    }
}

// ------------- Type -------------
#[derive(Debug, Clone)]
pub struct Type {
    id: i64,
    uuid: Uuid,
    name: String,
    label: String,
    parent: Option<i64>,
    is_abstract: bool,
    main_table: Option<i64>,
    // own attributes plus inherited ones, own ones win
    attributes: HashMap<String, Arc<Attribute>, OtherHasher>,
    children: Vec<i64>,
    classified_by: Vec<i64>,
    status_attribute: Option<String>,
}
impl Type {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        uuid: Uuid,
        name: String,
        label: String,
        parent: Option<i64>,
        is_abstract: bool,
        main_table: Option<i64>,
        attributes: HashMap<String, Arc<Attribute>, OtherHasher>,
        children: Vec<i64>,
        classified_by: Vec<i64>,
    ) -> Self {
        let mut status_attributes: Vec<&String> = attributes
            .iter()
            .filter(|(_, a)| a.attribute_type() == AttributeType::StatusLink)
            .map(|(n, _)| n)
            .collect();
        status_attributes.sort();
        let status_attribute = status_attributes.first().map(|n| n.to_string());
        Self {
            id,
            uuid,
            name,
            label,
            parent,
            is_abstract,
            main_table,
            attributes,
            children,
            classified_by,
            status_attribute,
        }
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn label(&self) -> &str {
        &self.label
    }
    pub fn parent(&self) -> Option<i64> {
        self.parent
    }
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }
    pub fn main_table(&self) -> Option<i64> {
        self.main_table
    }
    pub fn attribute(&self, name: &str) -> Option<&Arc<Attribute>> {
        self.attributes.get(name)
    }
    /// Like `attribute` but a miss is an error naming this type.
    pub fn require_attribute(&self, name: &str) -> Result<&Arc<Attribute>> {
        self.attributes
            .get(name)
            .ok_or_else(|| EfapsError::AttributeNotFound {
                type_name: self.name.clone(),
                attribute: name.to_string(),
            })
    }
    pub fn attributes(&self) -> impl Iterator<Item = &Arc<Attribute>> {
        self.attributes.values()
    }
    pub fn children(&self) -> &[i64] {
        &self.children
    }
    /// Root classifications this type can be classified by.
    pub fn classified_by(&self) -> &[i64] {
        &self.classified_by
    }
    pub fn status_attribute(&self) -> Option<&Arc<Attribute>> {
        self.status_attribute
            .as_ref()
            .and_then(|n| self.attributes.get(n))
    }
}
impl CacheObject for Type {
    const KIND: &'static str = "Type";
    fn cache_id(&self) -> i64 {
        self.id
    }
    fn cache_name(&self) -> &str {
        &self.name
    }
    fn cache_uuid(&self) -> Uuid {
        self.uuid
    }
}
impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ------------- Status -------------
#[derive(Debug, Clone)]
pub struct Status {
    id: i64,
    uuid: Uuid,
    group: i64,
    key: String,
    qualified_name: String,
    label: String,
}
impl Status {
    pub fn new(id: i64, uuid: Uuid, group: i64, group_name: &str, key: String, label: String) -> Self {
        let qualified_name = format!("{}.{}", group_name, key);
        Self {
            id,
            uuid,
            group,
            key,
            qualified_name,
            label,
        }
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
    /// Id of the status group type.
    pub fn group(&self) -> i64 {
        self.group
    }
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn label(&self) -> &str {
        &self.label
    }
}
impl CacheObject for Status {
    const KIND: &'static str = "Status";
    fn cache_id(&self) -> i64 {
        self.id
    }
    fn cache_name(&self) -> &str {
        &self.qualified_name
    }
    fn cache_uuid(&self) -> Uuid {
        self.uuid
    }
}

// ------------- Classification -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassificationRelation {
    pub sql_name: String,
    pub instance_column: String,
    pub classification_column: String,
}

#[derive(Debug, Clone)]
pub struct Classification {
    id: i64,
    uuid: Uuid,
    name: String,
    label: String,
    parent: Option<i64>,
    relation: ClassificationRelation,
}
impl Classification {
    pub fn new(
        id: i64,
        uuid: Uuid,
        name: String,
        label: String,
        parent: Option<i64>,
        relation: ClassificationRelation,
    ) -> Self {
        Self {
            id,
            uuid,
            name,
            label,
            parent,
            relation,
        }
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn label(&self) -> &str {
        &self.label
    }
    pub fn parent(&self) -> Option<i64> {
        self.parent
    }
    pub fn relation(&self) -> &ClassificationRelation {
        &self.relation
    }
}
impl CacheObject for Classification {
    const KIND: &'static str = "Classification";
    fn cache_id(&self) -> i64 {
        self.id
    }
    fn cache_name(&self) -> &str {
        &self.name
    }
    fn cache_uuid(&self) -> Uuid {
        self.uuid
    }
}
impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ------------- Dimension and Uom -------------
#[derive(Debug, Clone)]
pub struct Dimension {
    id: i64,
    uuid: Uuid,
    name: String,
    base_uom: Option<i64>,
}
impl Dimension {
    pub fn new(id: i64, uuid: Uuid, name: String, base_uom: Option<i64>) -> Self {
        Self {
            id,
            uuid,
            name,
            base_uom,
        }
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn base_uom(&self) -> Option<i64> {
        self.base_uom
    }
}
impl CacheObject for Dimension {
    const KIND: &'static str = "Dimension";
    fn cache_id(&self) -> i64 {
        self.id
    }
    fn cache_name(&self) -> &str {
        &self.name
    }
    fn cache_uuid(&self) -> Uuid {
        self.uuid
    }
}

#[derive(Debug, Clone)]
pub struct Uom {
    id: i64,
    uuid: Uuid,
    name: String,
    dimension: i64,
    numerator: BigDecimal,
    denominator: BigDecimal,
}
impl Uom {
    pub fn new(
        id: i64,
        uuid: Uuid,
        name: String,
        dimension: i64,
        numerator: BigDecimal,
        denominator: BigDecimal,
    ) -> Result<Self> {
        if denominator == BigDecimal::from(0) {
            return Err(EfapsError::Invariant(format!("uom {} has a zero denominator", name)));
        }
        Ok(Self {
            id,
            uuid,
            name,
            dimension,
            numerator,
            denominator,
        })
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn dimension(&self) -> i64 {
        self.dimension
    }
    pub fn to_base(&self, magnitude: &BigDecimal) -> BigDecimal {
        magnitude * &self.numerator / &self.denominator
    }
}
impl CacheObject for Uom {
    const KIND: &'static str = "Uom";
    fn cache_id(&self) -> i64 {
        self.id
    }
    fn cache_name(&self) -> &str {
        &self.name
    }
    fn cache_uuid(&self) -> Uuid {
        self.uuid
    }
}

// ------------- Database -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}
impl From<&str> for PersistenceMode {
    fn from(location: &str) -> Self {
        if location.is_empty() || location == ":memory:" {
            PersistenceMode::InMemory
        } else {
            PersistenceMode::File(location.to_string())
        }
    }
}

/// Owns the connection and the metadata cache built from it.
pub struct Database {
    persistor: Mutex<Persistor>,
    cache: MetadataCache,
    programs: ProgramRegistry,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Database> {
        let persistor = Persistor::open(&mode)?;
        info!(?mode, "database opened");
        Ok(Self::with_cache(persistor, MetadataCache::new()))
    }
    pub fn with_cache(persistor: Persistor, cache: MetadataCache) -> Database {
        Database {
            persistor: Mutex::new(persistor),
            cache,
            programs: ProgramRegistry::new(),
        }
    }
    pub fn persistor(&self) -> Result<MutexGuard<'_, Persistor>> {
        Ok(self.persistor.lock()?)
    }
    /// The cache as it is, possibly not yet initialized.
    pub fn raw_cache(&self) -> &MetadataCache {
        &self.cache
    }
    /// The cache, loaded from the metadata tables first if that has not happened yet.
    pub fn cache(&self) -> Result<&MetadataCache> {
        if !self.cache.is_initialized() {
            let persistor = self.persistor()?;
            self.cache.initialize(&*persistor)?;
        }
        Ok(&self.cache)
    }
    pub fn reload_cache(&self) -> Result<()> {
        let persistor = self.persistor()?;
        self.cache.reload(&*persistor)
    }
    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }
    pub fn register_program(&self, name: &str, program: Arc<dyn ExecProgram>) -> Result<()> {
        self.programs.register(name, program)
    }
    pub fn type_by_name(&self, name: &str) -> Result<Arc<Type>> {
        match self.cache()?.types().find_by_name(name) {
            Some(t) => Ok(t),
            None => Err(EfapsError::TypeNotFound(name.to_string())),
        }
    }
    /// Writes the model into the metadata tables, creates its business tables
    /// and reloads the cache.
    pub fn install(&self, model: &ModelDefinition) -> Result<()> {
        {
            let mut persistor = self.persistor()?;
            model.install(&mut persistor)?;
        }
        debug!(types = model.types.len(), "model installed");
        self.reload_cache()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Database")
            .field("cache", &self.cache)
            .field("programs", &self.programs)
            .finish()
    }
}
